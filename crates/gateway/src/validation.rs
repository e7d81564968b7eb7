//! Schema gate: one compiled JSON Schema validator per recognized event type.
//!
//! Loading happens in two passes. Every document under the contracts root is
//! registered by `$id` first, so cross-document `$ref`s resolve; then exactly
//! the event-type documents are compiled. The gate is immutable afterwards.

use crate::error::{GatewayError, Result};
use crate::events::EventType;
use jsonschema::{Resource, Validator};
use serde_json::Value;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// A single schema violation, for diagnostic logging only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    /// JSON pointer into the rejected event.
    pub instance_path: String,
    pub message: String,
}

/// All violations found in one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolations(pub Vec<SchemaViolation>);

impl fmt::Display for SchemaViolations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", v.instance_path, v.message)?;
        }
        Ok(())
    }
}

/// A parsed schema document and where it came from.
struct Document {
    path: PathBuf,
    /// File contents as read; duplicates must match byte for byte.
    raw: String,
    contents: Value,
}

/// Compiled validators keyed by event type.
pub struct SchemaGate {
    validators: HashMap<EventType, Validator>,
    document_count: usize,
}

impl SchemaGate {
    /// Load and compile the contracts under `root`.
    ///
    /// Fails if the root is missing, a document has no `$id`, two documents
    /// share an `$id` with different content, or any event type's schema is
    /// missing or does not compile. Identical duplicates are skipped.
    pub fn load(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(GatewayError::MissingContracts(root.to_path_buf()));
        }

        info!(root = %root.display(), "Loading contract schemas");
        let registry = register_documents(root)?;
        info!(count = registry.len(), "Registered schema documents");

        let mut validators = HashMap::with_capacity(EventType::ALL.len());
        for event in EventType::ALL {
            let path = root.join(event.schema_path());
            if !path.is_file() {
                return Err(GatewayError::MissingEventSchema { event, path });
            }
            let schema = read_document(&path)?;
            let validator = compile(event, &schema, &registry)?;
            validators.insert(event, validator);
            info!(event = %event, schema = event.schema_path(), "Compiled event schema");
        }

        info!(count = validators.len(), "Event validators ready");
        Ok(Self {
            validators,
            document_count: registry.len(),
        })
    }

    /// Validate an event by wire name.
    ///
    /// Fail-closed: unrecognized names and violations both return `false`.
    /// Violations are logged, never returned to clients.
    pub fn validate(&self, event_name: &str, data: &Value) -> bool {
        let Ok(event) = event_name.parse::<EventType>() else {
            error!(event_name, "Validator missing for event - refusing to send");
            return false;
        };
        match self.check(event, data) {
            Ok(()) => true,
            Err(violations) => {
                warn!(
                    event = %event,
                    violations = %violations,
                    "Event failed schema validation - dropped"
                );
                false
            }
        }
    }

    /// Validate and return every violation on failure.
    pub fn check(&self, event: EventType, data: &Value) -> std::result::Result<(), SchemaViolations> {
        let Some(validator) = self.validators.get(&event) else {
            return Err(SchemaViolations(vec![SchemaViolation {
                instance_path: String::new(),
                message: format!("no validator compiled for {}", event),
            }]));
        };

        if validator.is_valid(data) {
            return Ok(());
        }

        let violations: Vec<SchemaViolation> = validator
            .iter_errors(data)
            .map(|e| SchemaViolation {
                instance_path: e.instance_path.to_string(),
                message: e.to_string(),
            })
            .collect();
        Err(SchemaViolations(violations))
    }

    pub fn has_schema(&self, event_name: &str) -> bool {
        event_name
            .parse::<EventType>()
            .map(|event| self.validators.contains_key(&event))
            .unwrap_or(false)
    }

    /// Number of compiled event validators.
    pub fn schema_count(&self) -> usize {
        self.validators.len()
    }

    /// Number of distinct documents registered for `$ref` resolution.
    pub fn document_count(&self) -> usize {
        self.document_count
    }
}

fn register_documents(root: &Path) -> Result<BTreeMap<String, Document>> {
    let mut registry: BTreeMap<String, Document> = BTreeMap::new();

    for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
        let entry = entry.map_err(|e| GatewayError::SchemaParse {
            path: e.path().unwrap_or(root).to_path_buf(),
            reason: e.to_string(),
        })?;
        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().and_then(|e| e.to_str()) != Some("json")
        {
            continue;
        }

        let raw = read_raw(path)?;
        let contents = parse_document(path, &raw)?;
        let relative = path.strip_prefix(root).unwrap_or(path).to_path_buf();
        let id = contents
            .get("$id")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::MissingSchemaId(relative.clone()))?
            .to_string();

        match registry.entry(id) {
            Entry::Vacant(slot) => {
                debug!(schema_id = %slot.key(), file = %relative.display(), "Loaded schema");
                slot.insert(Document {
                    path: relative,
                    raw,
                    contents,
                });
            }
            Entry::Occupied(existing) => {
                if existing.get().raw != raw {
                    return Err(GatewayError::ConflictingSchema {
                        id: existing.key().clone(),
                        first: existing.get().path.clone(),
                        second: relative,
                    });
                }
                debug!(
                    schema_id = %existing.key(),
                    file = %relative.display(),
                    "Skipping identical duplicate schema"
                );
            }
        }
    }

    Ok(registry)
}

fn read_document(path: &Path) -> Result<Value> {
    let raw = read_raw(path)?;
    parse_document(path, &raw)
}

fn read_raw(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| GatewayError::SchemaParse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn parse_document(path: &Path, raw: &str) -> Result<Value> {
    serde_json::from_str(raw).map_err(|e| GatewayError::SchemaParse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn compile(
    event: EventType,
    schema: &Value,
    registry: &BTreeMap<String, Document>,
) -> Result<Validator> {
    let own_id = schema.get("$id").and_then(Value::as_str);
    let invalid = |reason: String| GatewayError::InvalidSchema { event, reason };

    let mut options = jsonschema::options().should_validate_formats(true);
    for (id, document) in registry {
        if Some(id.as_str()) == own_id {
            continue;
        }
        let resource = Resource::from_contents(document.contents.clone())
            .map_err(|e| invalid(format!("{}: {}", id, e)))?;
        options = options.with_resource(id.clone(), resource);
    }

    options.build(schema).map_err(|e| invalid(e.to_string()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn fixtures_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/schemas")
    }

    pub(crate) fn fixture_gate() -> SchemaGate {
        SchemaGate::load(fixtures_root()).expect("fixture contracts load")
    }

    /// Copy the fixture contracts into a scratch directory.
    fn scratch_contracts() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let src = fixtures_root();
        for entry in WalkDir::new(&src) {
            let entry = entry.unwrap();
            let target = dir.path().join(entry.path().strip_prefix(&src).unwrap());
            if entry.file_type().is_dir() {
                fs::create_dir_all(&target).unwrap();
            } else {
                fs::copy(entry.path(), &target).unwrap();
            }
        }
        dir
    }

    pub(crate) fn vitals_event(patient_id: &str) -> Value {
        json!({
            "event_name": "vitals.recorded",
            "event_version": "1.0.0",
            "event_id": "550e8400-e29b-41d4-a716-446655440000",
            "timestamp": "2025-01-15T10:30:00Z",
            "source": "test",
            "payload": {
                "patient_id": patient_id,
                "vital_type": "heart_rate",
                "value": 72,
                "unit": "bpm",
                "measured_at": "2025-01-15T10:29:58Z",
                "source": "test-device"
            }
        })
    }

    #[test]
    fn test_load_fixture_contracts() {
        let gate = fixture_gate();
        assert_eq!(gate.schema_count(), 4);
        assert_eq!(gate.document_count(), 6);
        for event in EventType::ALL {
            assert!(gate.has_schema(event.as_str()));
        }
        assert!(!gate.has_schema("unknown.event"));
    }

    #[test]
    fn test_valid_vitals_event() {
        let gate = fixture_gate();
        let event = vitals_event("550e8400-e29b-41d4-a716-446655440001");
        assert!(gate.validate("vitals.recorded", &event));
    }

    #[test]
    fn test_missing_required_field() {
        let gate = fixture_gate();
        let mut event = vitals_event("550e8400-e29b-41d4-a716-446655440001");
        event["payload"].as_object_mut().unwrap().remove("unit");

        assert!(!gate.validate("vitals.recorded", &event));
        let violations = gate.check(EventType::VitalsRecorded, &event).unwrap_err();
        assert!(violations
            .0
            .iter()
            .any(|v| v.message.contains("unit")));
    }

    #[test]
    fn test_wrong_primitive_type() {
        let gate = fixture_gate();
        let mut event = vitals_event("550e8400-e29b-41d4-a716-446655440001");
        event["payload"]["value"] = json!("seventy-two");

        let violations = gate.check(EventType::VitalsRecorded, &event).unwrap_err();
        assert!(violations.0.iter().any(|v| v.instance_path == "/payload/value"));
    }

    #[test]
    fn test_malformed_identifier_format() {
        let gate = fixture_gate();
        let event = vitals_event("not-a-uuid");
        assert!(!gate.validate("vitals.recorded", &event));
    }

    #[test]
    fn test_envelope_ref_is_enforced() {
        let gate = fixture_gate();
        let mut event = vitals_event("550e8400-e29b-41d4-a716-446655440001");
        event.as_object_mut().unwrap().remove("event_id");
        assert!(!gate.validate("vitals.recorded", &event));
    }

    #[test]
    fn test_unknown_event_type_fails_closed() {
        let gate = fixture_gate();
        assert!(!gate.validate("unknown.event", &json!({})));
    }

    #[test]
    fn test_dispatch_events_validate() {
        let gate = fixture_gate();
        let created = json!({
            "event_name": "dispatch.created",
            "event_version": "1.0.0",
            "event_id": "11111111-1111-4111-8111-111111111111",
            "timestamp": "2025-01-15T10:30:00Z",
            "payload": {
                "dispatch": {
                    "dispatch_id": "22222222-2222-4222-8222-222222222222",
                    "patient_id": "33333333-3333-4333-8333-333333333333",
                    "priority": "high",
                    "dispatch_type": "ambulance"
                }
            }
        });
        assert!(gate.validate("dispatch.created", &created));

        let assigned = json!({
            "event_name": "dispatch.assigned",
            "event_version": "1.0.0",
            "event_id": "44444444-4444-4444-8444-444444444444",
            "timestamp": "2025-01-15T10:31:00Z",
            "payload": {
                "dispatch_id": "22222222-2222-4222-8222-222222222222",
                "unit_id": "AMB-12",
                "assigned_at": "2025-01-15T10:31:00Z"
            }
        });
        assert!(gate.validate("dispatch.assigned", &assigned));
        // Schemas are not interchangeable.
        assert!(!gate.validate("dispatch.created", &assigned));
    }

    #[test]
    fn test_missing_root() {
        let err = SchemaGate::load("/definitely/not/here").err().unwrap();
        assert!(matches!(err, GatewayError::MissingContracts(_)));
    }

    #[test]
    fn test_identical_duplicate_is_skipped() {
        let dir = scratch_contracts();
        let mirror = dir.path().join("mirror/events");
        fs::create_dir_all(&mirror).unwrap();
        fs::copy(
            dir.path().join("events/vitals-recorded.json"),
            mirror.join("vitals-recorded.json"),
        )
        .unwrap();

        let gate = SchemaGate::load(dir.path()).unwrap();
        assert_eq!(gate.schema_count(), 4);
        assert_eq!(gate.document_count(), 6);
    }

    #[test]
    fn test_reformatted_duplicate_is_rejected() {
        let dir = scratch_contracts();
        let original = fs::read_to_string(dir.path().join("common/types.json")).unwrap();
        let compact: Value = serde_json::from_str(&original).unwrap();
        let mirror = dir.path().join("mirror");
        fs::create_dir_all(&mirror).unwrap();
        fs::write(mirror.join("types.json"), serde_json::to_string(&compact).unwrap()).unwrap();

        let err = SchemaGate::load(dir.path()).err().unwrap();
        assert!(matches!(
            err,
            GatewayError::ConflictingSchema { id, .. } if id.ends_with("common/types.json")
        ));
    }

    #[test]
    fn test_conflicting_duplicate_is_rejected() {
        let dir = scratch_contracts();
        let conflicting = json!({
            "$schema": "https://json-schema.org/draft/2020-12/schema",
            "$id": "https://contracts.health-platform.dev/schemas/events/vitals-recorded.json",
            "type": "object"
        });
        fs::write(
            dir.path().join("zz-conflict.json"),
            serde_json::to_string_pretty(&conflicting).unwrap(),
        )
        .unwrap();

        let err = SchemaGate::load(dir.path()).err().unwrap();
        match err {
            GatewayError::ConflictingSchema { id, .. } => {
                assert!(id.ends_with("events/vitals-recorded.json"))
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_document_without_id() {
        let dir = scratch_contracts();
        fs::write(dir.path().join("anonymous.json"), r#"{"type":"object"}"#).unwrap();

        let err = SchemaGate::load(dir.path()).err().unwrap();
        assert!(matches!(err, GatewayError::MissingSchemaId(p) if p == Path::new("anonymous.json")));
    }

    #[test]
    fn test_missing_event_schema() {
        let dir = scratch_contracts();
        fs::remove_file(dir.path().join("events/dispatch-assigned.json")).unwrap();

        let err = SchemaGate::load(dir.path()).err().unwrap();
        assert!(matches!(
            err,
            GatewayError::MissingEventSchema {
                event: EventType::DispatchAssigned,
                ..
            }
        ));
    }

    #[test]
    fn test_non_json_files_are_ignored() {
        let dir = scratch_contracts();
        fs::write(dir.path().join("README.md"), "# contracts").unwrap();
        assert!(SchemaGate::load(dir.path()).is_ok());
    }
}
