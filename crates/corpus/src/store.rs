use crate::value::{split_feature, Value, ValueType};
use crate::{Error, Result};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::cell::RefCell;
use std::collections::HashMap;

/// One row of the tier catalogue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureDef {
    pub id: i64,
    pub tier: String,
    pub feature: String,
    pub unittype: String,
    pub valuetype: ValueType,
}

struct Clock {
    /// Timestamp shared by every write of the enclosing transaction scope.
    frozen: Option<String>,
    /// False while a transaction scope is active.
    committing: bool,
}

/// The persistent annotation graph: a single-file SQLite database of units,
/// feature definitions, feature values, suggestions, and relations.
///
/// All writes are transactional. Operations that write open their own scope,
/// so `set_feature` in isolation commits by itself, while the same call under
/// [`Store::transaction`] shares the outer scope's timestamp and commit.
pub struct Store {
    conn: Connection,
    clock: RefCell<Clock>,
}

fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

impl Store {
    pub(crate) fn new(conn: Connection) -> Store {
        Store {
            conn,
            clock: RefCell::new(Clock {
                frozen: None,
                committing: true,
            }),
        }
    }

    /// The raw connection, for read-only callers that assemble their own SQL
    /// (the query planner and result projection).
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// The logical time of the current transaction scope, or fresh wall-clock
    /// time outside of one.
    pub fn now(&self) -> String {
        self.clock
            .borrow()
            .frozen
            .clone()
            .unwrap_or_else(timestamp)
    }

    /// Run `body` in a transaction scope. On entry the scope freezes a
    /// logical timestamp and suppresses per-operation commits; nested scopes
    /// re-enter the same logical transaction. The outermost scope commits on
    /// success and rolls back on error, so no partial write survives a
    /// failing batch. Generic over the caller's error type so importer and
    /// transformation batches can run whole programs inside one scope.
    pub fn transaction<T, E>(
        &self,
        body: impl FnOnce() -> std::result::Result<T, E>,
    ) -> std::result::Result<T, E>
    where
        E: From<Error>,
    {
        let (prev_frozen, prev_committing) = {
            let mut clock = self.clock.borrow_mut();
            let prev = (clock.frozen.clone(), clock.committing);
            clock.frozen = Some(clock.frozen.take().unwrap_or_else(timestamp));
            clock.committing = false;
            prev
        };
        if prev_committing {
            if let Err(err) = self.conn.execute_batch("BEGIN;") {
                let mut clock = self.clock.borrow_mut();
                clock.frozen = prev_frozen;
                clock.committing = prev_committing;
                return Err(E::from(Error::from(err)));
            }
        }
        let result = body();
        {
            let mut clock = self.clock.borrow_mut();
            clock.frozen = prev_frozen;
            clock.committing = prev_committing;
        }
        if !prev_committing {
            return result;
        }
        match result {
            Ok(value) => match self.conn.execute_batch("COMMIT;") {
                Ok(()) => Ok(value),
                Err(err) => Err(E::from(Error::from(err))),
            },
            Err(err) => {
                let _ = self.conn.execute_batch("ROLLBACK;");
                Err(err)
            }
        }
    }

    /// Idempotently register a unit type, creating its implicit `meta:active`
    /// feature. Returns whether the type was newly created.
    pub fn ensure_type(&self, unittype: &str) -> Result<bool> {
        let exists = self
            .conn
            .prepare_cached("SELECT 1 FROM tiers WHERE unittype = ? LIMIT 1")?
            .query_row([unittype], |_| Ok(()))
            .optional()?;
        if exists.is_some() {
            return Ok(false);
        }
        self.conn
            .prepare_cached(
                "INSERT INTO tiers (tier, feature, unittype, valuetype)
                 VALUES ('meta', 'active', ?, 'bool')",
            )?
            .execute([unittype])?;
        Ok(true)
    }

    pub fn type_exists(&self, unittype: &str) -> Result<bool> {
        let exists = self
            .conn
            .prepare_cached("SELECT 1 FROM tiers WHERE unittype = ? LIMIT 1")?
            .query_row([unittype], |_| Ok(()))
            .optional()?;
        Ok(exists.is_some())
    }

    /// Register a feature for a unit type. Re-registering with the same value
    /// type is a no-op returning the existing id; a conflicting value type is
    /// an error.
    pub fn create_feature(
        &self,
        unittype: &str,
        name: &str,
        valuetype: ValueType,
    ) -> Result<i64> {
        let (tier, feature) = split_feature(name)?;
        self.transaction(|| {
            self.ensure_type(unittype)?;
            if let Some((id, existing)) = self.get_feature_opt(unittype, name)? {
                if existing == valuetype {
                    return Ok(id);
                }
                return Err(Error::FeatureTypeConflict {
                    name: name.to_string(),
                    unittype: unittype.to_string(),
                    existing,
                });
            }
            self.conn
                .prepare_cached(
                    "INSERT INTO tiers (tier, feature, unittype, valuetype)
                     VALUES (?, ?, ?, ?)",
                )?
                .execute(params![tier, feature, unittype, valuetype.as_str()])?;
            Ok(self.conn.last_insert_rowid())
        })
    }

    pub fn get_feature_opt(
        &self,
        unittype: &str,
        name: &str,
    ) -> Result<Option<(i64, ValueType)>> {
        let (tier, feature) = split_feature(name)?;
        let row = self
            .conn
            .prepare_cached(
                "SELECT id, valuetype FROM tiers
                 WHERE unittype = ? AND tier = ? AND feature = ?",
            )?
            .query_row(params![unittype, tier, feature], |r| {
                Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?))
            })
            .optional()?;
        match row {
            Some((id, vt)) => Ok(Some((id, ValueType::parse(&vt)?))),
            None => Ok(None),
        }
    }

    /// Resolve a feature to `(id, value type)`, failing if it is undefined.
    pub fn get_feature(&self, unittype: &str, name: &str) -> Result<(i64, ValueType)> {
        self.get_feature_opt(unittype, name)?
            .ok_or_else(|| Error::UnknownFeature {
                name: name.to_string(),
                unittype: unittype.to_string(),
            })
    }

    /// All definitions of `name` across several unit types, ordered by id.
    /// Used when a query variable is declared with a type disjunction.
    pub fn get_feature_multi_type(
        &self,
        unittypes: &[String],
        name: &str,
    ) -> Result<Vec<(i64, ValueType)>> {
        if unittypes.is_empty() {
            return Ok(Vec::new());
        }
        let (tier, feature) = split_feature(name)?;
        let sql = format!(
            "SELECT id, valuetype FROM tiers
             WHERE tier = ? AND feature = ? AND unittype IN ({})
             ORDER BY id",
            placeholders(unittypes.len())
        );
        let mut params: Vec<SqlValue> =
            vec![tier.to_string().into(), feature.to_string().into()];
        params.extend(unittypes.iter().map(|t| SqlValue::from(t.clone())));
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params), |r| {
            Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, vt) = row?;
            out.push((id, ValueType::parse(&vt)?));
        }
        Ok(out)
    }

    pub fn get_all_features(&self) -> Result<Vec<FeatureDef>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, tier, feature, unittype, valuetype FROM tiers
             ORDER BY unittype, tier, feature",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, tier, feature, unittype, vt) = row?;
            out.push(FeatureDef {
                id,
                tier,
                feature,
                unittype,
                valuetype: ValueType::parse(&vt)?,
            });
        }
        Ok(out)
    }

    /// Allocate a unit of `unittype` and mark it active.
    pub fn create_unit(&self, unittype: &str, user: Option<&str>) -> Result<i64> {
        self.transaction(|| {
            self.ensure_type(unittype)?;
            let (meta, _) = self.get_feature(unittype, "meta:active")?;
            let now = self.now();
            self.conn
                .prepare_cached(
                    "INSERT INTO units (type, created, modified, active)
                     VALUES (?, ?, ?, 1)",
                )?
                .execute(params![unittype, now, now])?;
            let uid = self.conn.last_insert_rowid();
            self.conn
                .prepare_cached(
                    "INSERT INTO features (unit, feature, value, user, date)
                     VALUES (?, ?, '1', ?, ?)",
                )?
                .execute(params![uid, meta, user, now])?;
            Ok(uid)
        })
    }

    pub fn create_unit_with_features(
        &self,
        unittype: &str,
        feats: &[(&str, Value)],
        user: Option<&str>,
        parent: Option<i64>,
    ) -> Result<i64> {
        self.transaction(|| {
            let uid = self.create_unit(unittype, user)?;
            for (name, value) in feats {
                let (fid, vtype) = self.get_feature(unittype, name)?;
                vtype.check(name, value)?;
                self.conn
                    .prepare_cached(
                        "INSERT INTO features (unit, feature, value, user, confidence, date)
                         VALUES (?, ?, ?, ?, 1, ?)",
                    )?
                    .execute(params![uid, fid, value, user, self.now()])?;
            }
            if let Some(parent) = parent {
                let ptype = self.get_unit_type(parent)?;
                self.conn
                    .prepare_cached(
                        "INSERT INTO relations
                         (parent, parent_type, child, child_type, isprimary, active, date)
                         VALUES (?, ?, ?, ?, 1, 1, ?)",
                    )?
                    .execute(params![parent, ptype, uid, unittype, self.now()])?;
            }
            Ok(uid)
        })
    }

    pub fn get_unit_type(&self, unit: i64) -> Result<String> {
        self.conn
            .prepare_cached("SELECT type FROM units WHERE id = ?")?
            .query_row([unit], |r| r.get(0))
            .optional()?
            .ok_or(Error::MissingUnit(unit))
    }

    /// Upsert the authoritative value of a feature. At most one row exists
    /// per `(unit, feature)`; re-setting replaces value, author, confidence
    /// and date in place.
    pub fn set_feature(
        &self,
        unit: i64,
        name: &str,
        value: &Value,
        user: &str,
        confidence: i64,
    ) -> Result<()> {
        let unittype = self.get_unit_type(unit)?;
        let (fid, vtype) = self.get_feature(&unittype, name)?;
        vtype.check(name, value)?;
        self.transaction(|| {
            let now = self.now();
            self.conn
                .prepare_cached(
                    "UPDATE features SET value = ?, user = ?, confidence = ?, date = ?
                     WHERE unit = ? AND feature = ?",
                )?
                .execute(params![value, user, confidence, now, unit, fid])?;
            self.conn
                .prepare_cached(
                    "INSERT OR IGNORE INTO features
                     (unit, feature, value, user, confidence, date)
                     VALUES (?, ?, ?, ?, ?, ?)",
                )?
                .execute(params![unit, fid, value, user, confidence, now])?;
            Ok(())
        })
    }

    /// Delete the authoritative row for a feature. Suggestions are untouched.
    pub fn rem_feature(&self, unit: i64, name: &str) -> Result<()> {
        let unittype = self.get_unit_type(unit)?;
        let (fid, _) = self.get_feature(&unittype, name)?;
        self.conn
            .prepare_cached("DELETE FROM features WHERE unit = ? AND feature = ?")?
            .execute(params![unit, fid])?;
        Ok(())
    }

    /// Append suggested values for a feature. Probabilities must be positive
    /// and are normalised to sum to 1 unless `normalize` is false.
    pub fn set_feature_dist(
        &self,
        unit: i64,
        name: &str,
        values: &[(Value, f64)],
        normalize: bool,
    ) -> Result<()> {
        if values.is_empty() {
            return Err(Error::EmptyDistribution);
        }
        let unittype = self.get_unit_type(unit)?;
        let (fid, vtype) = self.get_feature(&unittype, name)?;
        let mut total = 0.0;
        for (value, probability) in values {
            vtype.check(name, value)?;
            if *probability <= 0.0 {
                return Err(Error::NonPositiveProbability);
            }
            total += probability;
        }
        if !normalize {
            total = 1.0;
        }
        self.transaction(|| {
            let mut stmt = self.conn.prepare_cached(
                "INSERT INTO suggestions (unit, feature, value, probability, date, active)
                 VALUES (?, ?, ?, ?, ?, 1)",
            )?;
            for (value, probability) in values {
                stmt.execute(params![unit, fid, value, probability / total, self.now()])?;
            }
            Ok(())
        })
    }

    /// Deactivate relations between a pair of units.
    pub fn rem_parent(&self, parent: i64, child: i64, primary_only: bool) -> Result<()> {
        let mut sql =
            "UPDATE relations SET active = 0 WHERE parent = ? AND child = ?".to_string();
        if primary_only {
            sql.push_str(" AND isprimary = 1");
        }
        self.conn.prepare(&sql)?.execute(params![parent, child])?;
        Ok(())
    }

    /// Attach `child` to `parent`. A primary edge displaces the child's
    /// current primary parent, keeping the single-active-primary invariant;
    /// `clear` additionally deactivates every existing edge of the pair.
    pub fn set_parent(&self, parent: i64, child: i64, primary: bool, clear: bool) -> Result<()> {
        let ptype = self.get_unit_type(parent)?;
        let ctype = self.get_unit_type(child)?;
        self.transaction(|| {
            if primary {
                self.conn
                    .prepare_cached(
                        "UPDATE relations SET active = 0 WHERE child = ? AND isprimary = 1",
                    )?
                    .execute([child])?;
            }
            if clear {
                self.rem_parent(parent, child, false)?;
            }
            self.conn
                .prepare_cached(
                    "INSERT OR IGNORE INTO relations
                     (parent, parent_type, child, child_type, isprimary, active, date)
                     VALUES (?, ?, ?, ?, ?, 1, ?)",
                )?
                .execute(params![parent, ptype, child, ctype, primary, self.now()])?;
            Ok(())
        })
    }

    /// The unique active primary parent of `child`, if any.
    pub fn get_parent(&self, child: i64) -> Result<Option<i64>> {
        Ok(self
            .conn
            .prepare_cached(
                "SELECT parent FROM relations
                 WHERE child = ? AND isprimary = 1 AND active = 1 LIMIT 1",
            )?
            .query_row([child], |r| r.get(0))
            .optional()?)
    }

    /// Active primary children of `child_type`, grouped by parent.
    pub fn get_children(
        &self,
        parents: &[i64],
        child_type: &str,
    ) -> Result<HashMap<i64, Vec<i64>>> {
        let mut out: HashMap<i64, Vec<i64>> = HashMap::new();
        if parents.is_empty() {
            return Ok(out);
        }
        let sql = format!(
            "SELECT parent, child FROM relations
             WHERE child_type = ? AND active = 1 AND isprimary = 1 AND parent IN ({})
             ORDER BY parent, child",
            placeholders(parents.len())
        );
        let mut params: Vec<SqlValue> = vec![child_type.to_string().into()];
        params.extend(parents.iter().map(|p| SqlValue::Integer(*p)));
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params), |r| {
            Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (parent, child) = row?;
            out.entry(parent).or_default().push(child);
        }
        Ok(out)
    }

    /// Active units of a type, optionally restricted to the primary children
    /// of `parent`.
    pub fn get_units(&self, unittype: &str, parent: Option<i64>) -> Result<Vec<i64>> {
        let mut out = Vec::new();
        match parent {
            None => {
                let mut stmt = self.conn.prepare_cached(
                    "SELECT id FROM units WHERE type = ? AND active = 1 ORDER BY id",
                )?;
                let rows = stmt.query_map([unittype], |r| r.get::<_, i64>(0))?;
                for row in rows {
                    out.push(row?);
                }
            }
            Some(parent) => {
                let mut stmt = self.conn.prepare_cached(
                    "SELECT child FROM relations
                     WHERE parent = ? AND child_type = ? AND active = 1 AND isprimary = 1
                     ORDER BY child",
                )?;
                let rows = stmt.query_map(params![parent, unittype], |r| r.get::<_, i64>(0))?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    /// The authoritative value of a feature on one unit.
    pub fn get_feature_value(&self, unit: i64, feature_id: i64) -> Result<Option<Value>> {
        let row = self
            .conn
            .prepare_cached(
                "SELECT f.value, t.tier, t.feature, t.valuetype
                 FROM features f JOIN tiers t ON t.id = f.feature
                 WHERE f.unit = ? AND f.feature = ?",
            )?
            .query_row(params![unit, feature_id], |r| {
                Ok((
                    r.get::<_, SqlValue>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                ))
            })
            .optional()?;
        match row {
            None => Ok(None),
            Some((raw, tier, feature, vt)) => {
                let name = crate::value::join_feature(&tier, &feature);
                Value::decode(raw, &name, ValueType::parse(&vt)?)
            }
        }
    }

    /// Authoritative values over several units and feature definitions,
    /// keyed by unit. With multiple definitions (the multi-type case), each
    /// unit carries at most one of them.
    pub fn get_feature_values(
        &self,
        units: &[i64],
        feature_ids: &[i64],
    ) -> Result<HashMap<i64, Value>> {
        let mut out = HashMap::new();
        if units.is_empty() || feature_ids.is_empty() {
            return Ok(out);
        }
        let sql = format!(
            "SELECT f.unit, f.value, t.tier, t.feature, t.valuetype
             FROM features f JOIN tiers t ON t.id = f.feature
             WHERE f.unit IN ({}) AND f.feature IN ({})",
            placeholders(units.len()),
            placeholders(feature_ids.len())
        );
        let mut params: Vec<SqlValue> = units.iter().map(|u| SqlValue::Integer(*u)).collect();
        params.extend(feature_ids.iter().map(|f| SqlValue::Integer(*f)));
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params), |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, SqlValue>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
            ))
        })?;
        for row in rows {
            let (unit, raw, tier, feature, vt) = row?;
            let name = crate::value::join_feature(&tier, &feature);
            if let Some(value) = Value::decode(raw, &name, ValueType::parse(&vt)?)? {
                out.insert(unit, value);
            }
        }
        Ok(out)
    }

    /// A single unit's values over several feature definitions, keyed by
    /// feature id.
    pub fn get_unit_features(
        &self,
        unit: i64,
        feature_ids: &[i64],
    ) -> Result<HashMap<i64, Value>> {
        let mut out = HashMap::new();
        if feature_ids.is_empty() {
            return Ok(out);
        }
        let sql = format!(
            "SELECT f.feature, f.value, t.tier, t.feature, t.valuetype
             FROM features f JOIN tiers t ON t.id = f.feature
             WHERE f.unit = ? AND f.feature IN ({})",
            placeholders(feature_ids.len())
        );
        let mut params: Vec<SqlValue> = vec![SqlValue::Integer(unit)];
        params.extend(feature_ids.iter().map(|f| SqlValue::Integer(*f)));
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params), |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, SqlValue>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
            ))
        })?;
        for row in rows {
            let (fid, raw, tier, feature, vt) = row?;
            let name = crate::value::join_feature(&tier, &feature);
            if let Some(value) = Value::decode(raw, &name, ValueType::parse(&vt)?)? {
                out.insert(fid, value);
            }
        }
        Ok(out)
    }

    /// Deactivate a unit: the unit row and its `meta:active` feature both go
    /// false. Nothing is physically deleted and the id stays reserved.
    pub fn rem_unit(&self, unit: i64, user: &str) -> Result<()> {
        self.get_unit_type(unit)?;
        self.transaction(|| {
            self.conn
                .prepare_cached("UPDATE units SET active = 0, modified = ? WHERE id = ?")?
                .execute(params![self.now(), unit])?;
            self.set_feature(unit, "meta:active", &Value::Bool(false), user, 1)
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::create;

    #[test]
    fn unit_types_are_stable() {
        let store = create(":memory:").unwrap();
        let uid = store.create_unit("word", Some("tester")).unwrap();
        assert_eq!(store.get_unit_type(uid).unwrap(), "word");
        assert_eq!(store.get_unit_type(uid).unwrap(), "word");
        assert!(matches!(
            store.get_unit_type(uid + 100),
            Err(Error::MissingUnit(_))
        ));
    }

    #[test]
    fn ensure_type_is_idempotent() {
        let store = create(":memory:").unwrap();
        assert!(store.ensure_type("word").unwrap());
        assert!(!store.ensure_type("word").unwrap());
        let (_, vt) = store.get_feature("word", "meta:active").unwrap();
        assert_eq!(vt, ValueType::Bool);
    }

    #[test]
    fn feature_upserts_keep_one_row() {
        let store = create(":memory:").unwrap();
        let uid = store.create_unit("word", None).unwrap();
        store
            .create_feature("word", "UD:lemma", ValueType::Str)
            .unwrap();
        store
            .set_feature(uid, "UD:lemma", &"run".into(), "a", 1)
            .unwrap();
        store
            .set_feature(uid, "UD:lemma", &"ran".into(), "b", 2)
            .unwrap();
        let n: i64 = store
            .conn
            .query_row(
                "SELECT COUNT(*) FROM features f JOIN tiers t ON t.id = f.feature
                 WHERE f.unit = ? AND t.tier = 'UD'",
                [uid],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(n, 1);
        let (fid, _) = store.get_feature("word", "UD:lemma").unwrap();
        assert_eq!(
            store.get_feature_value(uid, fid).unwrap(),
            Some(Value::Str("ran".into()))
        );
    }

    #[test]
    fn feature_redefinition_with_conflicting_type_fails() {
        let store = create(":memory:").unwrap();
        let first = store
            .create_feature("word", "UD:head", ValueType::Ref)
            .unwrap();
        let again = store
            .create_feature("word", "UD:head", ValueType::Ref)
            .unwrap();
        assert_eq!(first, again);
        assert!(matches!(
            store.create_feature("word", "UD:head", ValueType::Str),
            Err(Error::FeatureTypeConflict { .. })
        ));
    }

    #[test]
    fn set_feature_rejects_mismatched_values() {
        let store = create(":memory:").unwrap();
        let uid = store.create_unit("word", None).unwrap();
        store
            .create_feature("word", "meta:index", ValueType::Int)
            .unwrap();
        assert!(matches!(
            store.set_feature(uid, "meta:index", &"one".into(), "t", 1),
            Err(Error::TypeMismatch { .. })
        ));
        assert!(matches!(
            store.set_feature(uid, "no:such", &Value::Int(1), "t", 1),
            Err(Error::UnknownFeature { .. })
        ));
    }

    #[test]
    fn primary_parent_is_exclusive() {
        let store = create(":memory:").unwrap();
        let s1 = store.create_unit("sentence", None).unwrap();
        let s2 = store.create_unit("sentence", None).unwrap();
        let w = store.create_unit("word", None).unwrap();
        store.set_parent(s1, w, true, true).unwrap();
        store.set_parent(s2, w, true, true).unwrap();
        assert_eq!(store.get_parent(w).unwrap(), Some(s2));
        let live: i64 = store
            .conn
            .query_row(
                "SELECT COUNT(*) FROM relations WHERE child = ? AND isprimary = 1 AND active = 1",
                [w],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(live, 1);
    }

    #[test]
    fn secondary_relations_accumulate() {
        let store = create(":memory:").unwrap();
        let a = store.create_unit("word", None).unwrap();
        let b = store.create_unit("word", None).unwrap();
        let c = store.create_unit("word", None).unwrap();
        store.set_parent(a, c, false, false).unwrap();
        store.set_parent(b, c, false, false).unwrap();
        assert_eq!(store.get_parent(c).unwrap(), None);
        let live: i64 = store
            .conn
            .query_row(
                "SELECT COUNT(*) FROM relations WHERE child = ? AND active = 1",
                [c],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(live, 2);
    }

    #[test]
    fn suggestion_probabilities_normalise() {
        let store = create(":memory:").unwrap();
        let uid = store.create_unit("word", None).unwrap();
        store.create_feature("word", "x:y", ValueType::Str).unwrap();
        store
            .set_feature_dist(
                uid,
                "x:y",
                &[("a".into(), 1.0), ("b".into(), 3.0)],
                true,
            )
            .unwrap();
        let probs: Vec<f64> = {
            let mut stmt = store
                .conn
                .prepare("SELECT probability FROM suggestions WHERE unit = ? ORDER BY id")
                .unwrap();
            let rows = stmt.query_map([uid], |r| r.get(0)).unwrap();
            rows.map(|r| r.unwrap()).collect()
        };
        assert_eq!(probs, vec![0.25, 0.75]);
        let total: f64 = probs.iter().sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn suggestion_probabilities_can_stay_raw() {
        let store = create(":memory:").unwrap();
        let uid = store.create_unit("word", None).unwrap();
        store.create_feature("word", "x:y", ValueType::Str).unwrap();
        store
            .set_feature_dist(
                uid,
                "x:y",
                &[("a".into(), 1.0), ("b".into(), 3.0)],
                false,
            )
            .unwrap();
        let probs: Vec<f64> = {
            let mut stmt = store
                .conn
                .prepare("SELECT probability FROM suggestions WHERE unit = ? ORDER BY id")
                .unwrap();
            let rows = stmt.query_map([uid], |r| r.get(0)).unwrap();
            rows.map(|r| r.unwrap()).collect()
        };
        assert_eq!(probs, vec![1.0, 3.0]);
        assert!(matches!(
            store.set_feature_dist(uid, "x:y", &[], true),
            Err(Error::EmptyDistribution)
        ));
        assert!(matches!(
            store.set_feature_dist(uid, "x:y", &[("a".into(), 0.0)], true),
            Err(Error::NonPositiveProbability)
        ));
    }

    #[test]
    fn transactions_share_one_timestamp_and_roll_back() {
        let store = create(":memory:").unwrap();
        store
            .transaction(|| -> Result<()> {
                let a = store.create_unit("word", None)?;
                let b = store.create_unit("word", None)?;
                let dates: Vec<String> = {
                    let mut stmt = store
                        .conn
                        .prepare("SELECT created FROM units WHERE id IN (?, ?)")
                        .unwrap();
                    let rows = stmt.query_map(params![a, b], |r| r.get(0)).unwrap();
                    rows.map(|r| r.unwrap()).collect()
                };
                assert_eq!(dates[0], dates[1]);
                Ok(())
            })
            .unwrap();

        let result: Result<()> = store.transaction(|| {
            store.create_unit("phrase", None)?;
            Err(Error::MissingUnit(999))
        });
        assert!(result.is_err());
        assert_eq!(store.get_units("phrase", None).unwrap(), Vec::<i64>::new());
        // The successful scope's writes are intact.
        assert_eq!(store.get_units("word", None).unwrap().len(), 2);
    }

    #[test]
    fn removed_units_disappear_from_listings() {
        let store = create(":memory:").unwrap();
        let a = store.create_unit("word", None).unwrap();
        let b = store.create_unit("word", None).unwrap();
        store.rem_unit(a, "tester").unwrap();
        assert_eq!(store.get_units("word", None).unwrap(), vec![b]);
        // The id is still resolvable; deactivation is not deletion.
        assert_eq!(store.get_unit_type(a).unwrap(), "word");
    }
}
