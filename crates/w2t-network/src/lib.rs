use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

/// Well-known attribute names on target-network features.
pub mod fields {
    pub const OBJ_ID: &str = "obj_id";
    pub const IDENTIFIER: &str = "identifier";
    pub const FROM_IDENTIFIER: &str = "from_identifier";
    pub const TO_IDENTIFIER: &str = "to_identifier";
    pub const LENGTH_EFFECTIVE: &str = "length_effective";
    pub const WS_OBJ_ID: &str = "ws_obj_id";
    pub const RP_FROM_OBJ_ID: &str = "rp_from_obj_id";
    pub const RP_TO_OBJ_ID: &str = "rp_to_obj_id";
    pub const STRUCTURE_CONDITION: &str = "structure_condition";
    pub const FK_EXAMINATION: &str = "fk_examination";
    pub const FK_WASTEWATER_STRUCTURE: &str = "fk_wastewater_structure";
    pub const FK_MAINTENANCE_EVENT: &str = "fk_maintenance_event";
}

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("layer '{layer}' not found in the target project")]
    LayerNotFound { layer: String },
    #[error("layer '{layer}' has no field '{field}'")]
    UnknownField { layer: String, field: String },
    #[error("no edit session is open")]
    NoEditSession,
    #[error("an edit session is already open")]
    EditSessionOpen,
    #[error("feature rejected by layer '{layer}' (obj_id {obj_id}): {detail}")]
    FeatureRejected {
        layer: String,
        obj_id: String,
        detail: String,
    },
}

/// One target-network record: an ordered attribute map. Unset attributes are
/// simply absent; NULL columns are not materialized on read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Feature {
    attrs: BTreeMap<String, Value>,
}

impl Feature {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        let value = value.into();
        if value.is_null() {
            self.attrs.remove(name);
        } else {
            self.attrs.insert(name.to_string(), value);
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attrs.get(name)
    }

    pub fn as_str(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).and_then(Value::as_str)
    }

    pub fn as_f64(&self, name: &str) -> Option<f64> {
        self.attrs.get(name).and_then(Value::as_f64)
    }

    pub fn as_i64(&self, name: &str) -> Option<i64> {
        self.attrs.get(name).and_then(Value::as_i64)
    }

    pub fn obj_id(&self) -> Option<&str> {
        self.as_str(fields::OBJ_ID)
    }

    pub fn attrs(&self) -> &BTreeMap<String, Value> {
        &self.attrs
    }
}

/// The editable side of the target network. Adding and updating features is
/// only legal inside an edit session; the session is atomic across every
/// layer of the store, so one failed record rolls back all of them.
pub trait NetworkStore {
    fn has_layer(&self, layer: &str) -> Result<bool, NetworkError>;
    fn find_feature(
        &self,
        layer: &str,
        filters: &[(&str, Value)],
    ) -> Result<Option<Feature>, NetworkError>;
    fn feature_by_id(&self, layer: &str, obj_id: &str) -> Result<Option<Feature>, NetworkError>;
    fn generate_object_id(&self, layer: &str) -> Result<String, NetworkError>;
    fn begin_edit(&mut self, layers: &[&str]) -> Result<(), NetworkError>;
    fn commit_edit(&mut self) -> Result<(), NetworkError>;
    fn rollback_edit(&mut self) -> Result<(), NetworkError>;
    fn add_feature(&mut self, layer: &str, feature: &Feature) -> Result<(), NetworkError>;
    fn update_feature(&mut self, layer: &str, feature: &Feature) -> Result<(), NetworkError>;
}

/// SQLite-backed working copy of the target network, one table per layer
/// with `obj_id` as primary key. The edit session maps onto one SQLite
/// transaction, which is what makes the four-store import scope atomic.
pub struct SqliteNetworkStore {
    conn: Connection,
    editing: bool,
    columns: RefCell<BTreeMap<String, Vec<String>>>,
}

impl SqliteNetworkStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, NetworkError> {
        Ok(Self::from_connection(Connection::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self, NetworkError> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn,
            editing: false,
            columns: RefCell::new(BTreeMap::new()),
        }
    }

    /// Provision a working-copy table. `obj_id` is implied and always the
    /// primary key.
    pub fn create_layer(&self, name: &str, columns: &[&str]) -> Result<(), NetworkError> {
        let mut ddl = format!("CREATE TABLE \"{name}\" (obj_id TEXT PRIMARY KEY");
        for column in columns {
            ddl.push_str(&format!(", \"{column}\""));
        }
        ddl.push(')');
        self.conn.execute(&ddl, [])?;
        self.columns.borrow_mut().remove(name);
        Ok(())
    }

    fn layer_columns(&self, layer: &str) -> Result<Vec<String>, NetworkError> {
        if let Some(columns) = self.columns.borrow().get(layer) {
            return Ok(columns.clone());
        }
        if !self.has_layer(layer)? {
            return Err(NetworkError::LayerNotFound {
                layer: layer.to_string(),
            });
        }
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info(\"{layer}\")"))?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<Vec<_>, _>>()?;
        self.columns
            .borrow_mut()
            .insert(layer.to_string(), columns.clone());
        Ok(columns)
    }

    fn check_fields(&self, layer: &str, names: &[&str]) -> Result<(), NetworkError> {
        let columns = self.layer_columns(layer)?;
        for name in names {
            if !columns.iter().any(|column| column == name) {
                return Err(NetworkError::UnknownField {
                    layer: layer.to_string(),
                    field: name.to_string(),
                });
            }
        }
        Ok(())
    }

    fn query_one(
        &self,
        layer: &str,
        filters: &[(&str, Value)],
    ) -> Result<Option<Feature>, NetworkError> {
        let filter_fields = filters.iter().map(|(name, _)| *name).collect::<Vec<_>>();
        self.check_fields(layer, &filter_fields)?;

        let mut sql = format!("SELECT * FROM \"{layer}\"");
        if !filters.is_empty() {
            let clauses = filters
                .iter()
                .map(|(name, _)| format!("\"{name}\" = ?"))
                .collect::<Vec<_>>()
                .join(" AND ");
            sql.push_str(" WHERE ");
            sql.push_str(&clauses);
        }
        sql.push_str(" LIMIT 1");

        let mut stmt = self.conn.prepare(&sql)?;
        let column_names = stmt
            .column_names()
            .into_iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        let params = filters
            .iter()
            .map(|(_, value)| json_to_sql(value))
            .collect::<Vec<_>>();

        let mut rows = stmt.query(params_from_iter(params))?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };

        let mut feature = Feature::new();
        for (index, name) in column_names.iter().enumerate() {
            match row.get_ref(index)? {
                ValueRef::Null => {}
                ValueRef::Integer(value) => feature.set(name, value),
                ValueRef::Real(value) => feature.set(name, value),
                ValueRef::Text(value) => {
                    feature.set(name, String::from_utf8_lossy(value).into_owned())
                }
                ValueRef::Blob(_) => {}
            }
        }
        Ok(Some(feature))
    }
}

impl NetworkStore for SqliteNetworkStore {
    fn has_layer(&self, layer: &str) -> Result<bool, NetworkError> {
        // No row means no layer; any other error is a real store failure.
        let row = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [layer],
                |_| Ok(()),
            )
            .optional()?;
        Ok(row.is_some())
    }

    fn find_feature(
        &self,
        layer: &str,
        filters: &[(&str, Value)],
    ) -> Result<Option<Feature>, NetworkError> {
        self.query_one(layer, filters)
    }

    fn feature_by_id(&self, layer: &str, obj_id: &str) -> Result<Option<Feature>, NetworkError> {
        self.query_one(layer, &[(fields::OBJ_ID, Value::from(obj_id))])
    }

    fn generate_object_id(&self, _layer: &str) -> Result<String, NetworkError> {
        Ok(Uuid::new_v4().simple().to_string())
    }

    fn begin_edit(&mut self, layers: &[&str]) -> Result<(), NetworkError> {
        if self.editing {
            return Err(NetworkError::EditSessionOpen);
        }
        for layer in layers {
            if !self.has_layer(layer)? {
                return Err(NetworkError::LayerNotFound {
                    layer: layer.to_string(),
                });
            }
        }
        self.conn.execute_batch("BEGIN")?;
        self.editing = true;
        Ok(())
    }

    fn commit_edit(&mut self) -> Result<(), NetworkError> {
        if !self.editing {
            return Err(NetworkError::NoEditSession);
        }
        self.conn.execute_batch("COMMIT")?;
        self.editing = false;
        Ok(())
    }

    fn rollback_edit(&mut self) -> Result<(), NetworkError> {
        if !self.editing {
            return Err(NetworkError::NoEditSession);
        }
        self.conn.execute_batch("ROLLBACK")?;
        self.editing = false;
        Ok(())
    }

    fn add_feature(&mut self, layer: &str, feature: &Feature) -> Result<(), NetworkError> {
        if !self.editing {
            return Err(NetworkError::NoEditSession);
        }
        let names = feature
            .attrs()
            .keys()
            .map(String::as_str)
            .collect::<Vec<_>>();
        self.check_fields(layer, &names)?;

        let column_list = names
            .iter()
            .map(|name| format!("\"{name}\""))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = vec!["?"; names.len()].join(", ");
        let sql = format!("INSERT INTO \"{layer}\" ({column_list}) VALUES ({placeholders})");
        let params = feature.attrs().values().map(json_to_sql).collect::<Vec<_>>();

        self.conn
            .execute(&sql, params_from_iter(params))
            .map_err(|err| NetworkError::FeatureRejected {
                layer: layer.to_string(),
                obj_id: feature.obj_id().unwrap_or("<unset>").to_string(),
                detail: err.to_string(),
            })?;
        Ok(())
    }

    fn update_feature(&mut self, layer: &str, feature: &Feature) -> Result<(), NetworkError> {
        if !self.editing {
            return Err(NetworkError::NoEditSession);
        }
        let Some(obj_id) = feature.obj_id().map(ToString::to_string) else {
            return Err(NetworkError::FeatureRejected {
                layer: layer.to_string(),
                obj_id: "<unset>".to_string(),
                detail: "update requires an obj_id".to_string(),
            });
        };

        let names = feature
            .attrs()
            .keys()
            .filter(|name| name.as_str() != fields::OBJ_ID)
            .map(String::as_str)
            .collect::<Vec<_>>();
        self.check_fields(layer, &names)?;
        if names.is_empty() {
            return Ok(());
        }

        let assignments = names
            .iter()
            .map(|name| format!("\"{name}\" = ?"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("UPDATE \"{layer}\" SET {assignments} WHERE obj_id = ?");
        let mut params = names
            .iter()
            .map(|name| json_to_sql(feature.get(name).unwrap_or(&Value::Null)))
            .collect::<Vec<_>>();
        params.push(SqlValue::Text(obj_id.clone()));

        let changed = self
            .conn
            .execute(&sql, params_from_iter(params))
            .map_err(|err| NetworkError::FeatureRejected {
                layer: layer.to_string(),
                obj_id: obj_id.clone(),
                detail: err.to_string(),
            })?;
        if changed == 0 {
            return Err(NetworkError::FeatureRejected {
                layer: layer.to_string(),
                obj_id,
                detail: "no such feature".to_string(),
            });
        }
        Ok(())
    }
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(value) => SqlValue::Integer(i64::from(*value)),
        Value::Number(value) => {
            if let Some(value) = value.as_i64() {
                SqlValue::Integer(value)
            } else {
                SqlValue::Real(value.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(value) => SqlValue::Text(value.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_reaches() -> SqliteNetworkStore {
        let store = SqliteNetworkStore::open_in_memory().expect("open store");
        store
            .create_layer(
                "vw_qgep_reach",
                &[
                    fields::IDENTIFIER,
                    fields::FROM_IDENTIFIER,
                    fields::TO_IDENTIFIER,
                    fields::LENGTH_EFFECTIVE,
                    fields::WS_OBJ_ID,
                ],
            )
            .expect("create layer");
        store
    }

    fn reach(obj_id: &str, from: &str, to: &str) -> Feature {
        Feature::new()
            .with(fields::OBJ_ID, obj_id)
            .with(fields::IDENTIFIER, "main street")
            .with(fields::FROM_IDENTIFIER, from)
            .with(fields::TO_IDENTIFIER, to)
            .with(fields::LENGTH_EFFECTIVE, 12.5)
            .with(fields::WS_OBJ_ID, format!("ws-{obj_id}"))
    }

    #[test]
    fn add_and_query_by_filters() {
        let mut store = store_with_reaches();
        store.begin_edit(&["vw_qgep_reach"]).expect("begin edit");
        store
            .add_feature("vw_qgep_reach", &reach("ch-1", "MH1", "MH2"))
            .expect("add feature");
        store
            .add_feature("vw_qgep_reach", &reach("ch-2", "MH2", "MH3"))
            .expect("add feature");
        store.commit_edit().expect("commit");

        let hit = store
            .find_feature(
                "vw_qgep_reach",
                &[
                    (fields::FROM_IDENTIFIER, Value::from("MH2")),
                    (fields::TO_IDENTIFIER, Value::from("MH3")),
                ],
            )
            .expect("query")
            .expect("feature exists");
        assert_eq!(hit.obj_id(), Some("ch-2"));
        assert_eq!(hit.as_f64(fields::LENGTH_EFFECTIVE), Some(12.5));

        let miss = store
            .find_feature(
                "vw_qgep_reach",
                &[(fields::FROM_IDENTIFIER, Value::from("MH9"))],
            )
            .expect("query");
        assert!(miss.is_none());
    }

    #[test]
    fn writes_require_an_edit_session() {
        let mut store = store_with_reaches();
        let err = store
            .add_feature("vw_qgep_reach", &reach("ch-1", "MH1", "MH2"))
            .expect_err("must fail");
        assert!(matches!(err, NetworkError::NoEditSession));
    }

    #[test]
    fn unknown_attribute_is_rejected_before_insert() {
        let mut store = store_with_reaches();
        store.begin_edit(&["vw_qgep_reach"]).expect("begin edit");
        let feature = reach("ch-1", "MH1", "MH2").with("no_such_field", 1);
        let err = store
            .add_feature("vw_qgep_reach", &feature)
            .expect_err("must fail");
        assert!(matches!(err, NetworkError::UnknownField { .. }));
    }

    #[test]
    fn rollback_discards_every_write_of_the_session() {
        let mut store = store_with_reaches();
        store.begin_edit(&["vw_qgep_reach"]).expect("begin edit");
        store
            .add_feature("vw_qgep_reach", &reach("ch-1", "MH1", "MH2"))
            .expect("add feature");
        store
            .add_feature("vw_qgep_reach", &reach("ch-2", "MH2", "MH3"))
            .expect("add feature");
        store.rollback_edit().expect("rollback");

        assert!(store
            .feature_by_id("vw_qgep_reach", "ch-1")
            .expect("query")
            .is_none());
        assert!(store
            .feature_by_id("vw_qgep_reach", "ch-2")
            .expect("query")
            .is_none());
    }

    #[test]
    fn update_rewrites_attributes_in_place() {
        let mut store = store_with_reaches();
        store.begin_edit(&["vw_qgep_reach"]).expect("begin edit");
        store
            .add_feature("vw_qgep_reach", &reach("ch-1", "MH1", "MH2"))
            .expect("add feature");
        let patch = Feature::new()
            .with(fields::OBJ_ID, "ch-1")
            .with(fields::LENGTH_EFFECTIVE, 99.0);
        store
            .update_feature("vw_qgep_reach", &patch)
            .expect("update");
        store.commit_edit().expect("commit");

        let feature = store
            .feature_by_id("vw_qgep_reach", "ch-1")
            .expect("query")
            .expect("feature exists");
        assert_eq!(feature.as_f64(fields::LENGTH_EFFECTIVE), Some(99.0));
        assert_eq!(feature.as_str(fields::FROM_IDENTIFIER), Some("MH1"));
    }

    #[test]
    fn missing_layer_is_reported_at_session_start() {
        let mut store = store_with_reaches();
        let err = store
            .begin_edit(&["vw_qgep_reach", "vw_qgep_damage"])
            .expect_err("must fail");
        assert!(matches!(
            err,
            NetworkError::LayerNotFound { layer } if layer == "vw_qgep_damage"
        ));
    }

    #[test]
    fn absent_layer_is_a_clean_negative_not_an_error() {
        let store = store_with_reaches();
        assert!(store.has_layer("vw_qgep_reach").expect("query"));
        assert!(!store.has_layer("vw_qgep_damage").expect("query"));
    }

    #[test]
    fn generated_object_ids_are_unique() {
        let store = store_with_reaches();
        let first = store.generate_object_id("vw_qgep_reach").expect("id");
        let second = store.generate_object_id("vw_qgep_reach").expect("id");
        assert_ne!(first, second);
    }
}
