use crate::mapping::Mapping;
use crate::store::{placeholders, Store};
use crate::value::{Value, ValueType};
use crate::{Error, Result};
use indexmap::{IndexMap, IndexSet};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter};
use std::collections::{BTreeSet, HashMap, HashSet};

/// A feature value staged by a reader. Ref features name another unit of the
/// same batch symbolically; the name resolves to an id when the block
/// flushes.
#[derive(Debug, Clone, PartialEq)]
pub enum StagedValue {
    Value(Value),
    Ref(String),
}

impl From<Value> for StagedValue {
    fn from(v: Value) -> StagedValue {
        StagedValue::Value(v)
    }
}

type FeatureKey = (String, ValueType);

/// The importer runtime: an in-memory batch of pending units, edges, and
/// features keyed by reader-chosen symbolic names. [`StagingBuffer::finish_block`]
/// flushes the batch into the [`Store`] in one transaction, optionally
/// resolving names against previously imported units through the configured
/// merge-on rule.
pub struct StagingBuffer<'a> {
    store: &'a Store,
    user: String,
    /// Stored unit type → feature identifying previously imported units.
    merge_on: HashMap<String, String>,
    type_map: HashMap<String, String>,
    feature_map: HashMap<(String, Option<String>), String>,
    known_feats: HashMap<(String, String), i64>,
    uids: HashMap<String, i64>,

    names: IndexSet<String>,
    types: HashMap<String, String>,
    parents: HashMap<String, String>,
    relations: HashMap<String, BTreeSet<String>>,
    features: HashMap<String, IndexMap<FeatureKey, (StagedValue, Option<i64>)>>,
    blocks: u64,
}

impl<'a> StagingBuffer<'a> {
    pub fn new(store: &'a Store, user: &str) -> StagingBuffer<'a> {
        StagingBuffer {
            store,
            user: user.to_string(),
            merge_on: HashMap::new(),
            type_map: HashMap::new(),
            feature_map: HashMap::new(),
            known_feats: HashMap::new(),
            uids: HashMap::new(),
            names: IndexSet::new(),
            types: HashMap::new(),
            parents: HashMap::new(),
            relations: HashMap::new(),
            features: HashMap::new(),
            blocks: 0,
        }
    }

    /// Configure merge-on identity resolution: for each listed unit type, the
    /// named feature identifies previously imported units to merge onto.
    pub fn set_merge_on(&mut self, merge_on: HashMap<String, String>) {
        self.merge_on = merge_on;
    }

    /// Apply a vocabulary mapping to everything staged from here on: types
    /// translate as they are staged, features as the block flushes.
    pub fn set_mapping(&mut self, mapping: &Mapping) {
        self.type_map = mapping.types.clone();
        self.feature_map = mapping.import_feature_map();
    }

    fn note_name(&mut self, name: &str) {
        if !self.names.contains(name) {
            self.names.insert(name.to_string());
        }
    }

    pub fn set_type(&mut self, name: &str, unittype: &str) {
        self.note_name(name);
        let mapped = self
            .type_map
            .get(unittype)
            .cloned()
            .unwrap_or_else(|| unittype.to_string());
        self.types.insert(name.to_string(), mapped);
    }

    pub fn set_parent(&mut self, child: &str, parent: &str) {
        self.note_name(parent);
        self.note_name(child);
        self.parents.insert(child.to_string(), parent.to_string());
    }

    pub fn add_relation(&mut self, child: &str, parent: &str) {
        self.note_name(parent);
        self.note_name(child);
        self.relations
            .entry(child.to_string())
            .or_default()
            .insert(parent.to_string());
    }

    pub fn set_feature(
        &mut self,
        name: &str,
        feature: &str,
        valuetype: ValueType,
        value: StagedValue,
        confidence: Option<i64>,
    ) -> Result<()> {
        match (&valuetype, &value) {
            (ValueType::Ref, StagedValue::Ref(target)) => {
                let target = target.clone();
                self.note_name(&target)
            }
            (_, StagedValue::Ref(_)) | (ValueType::Ref, StagedValue::Value(_)) => {
                return Err(Error::TypeMismatch {
                    feature: feature.to_string(),
                    expected: valuetype,
                })
            }
            (_, StagedValue::Value(v)) => valuetype.check(feature, v)?,
        }
        self.note_name(name);
        self.features
            .entry(name.to_string())
            .or_default()
            .insert((feature.to_string(), valuetype), (value, confidence));
        Ok(())
    }

    /// The id a name resolved to in a previous `finish_block(.., keep_uids)`.
    pub fn uid(&self, name: &str) -> Option<i64> {
        self.uids.get(name).copied()
    }

    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    /// Drop the pending block without touching the store. Names that already
    /// resolved to ids in earlier blocks survive.
    pub fn discard_block(&mut self) {
        self.names.clear();
        self.parents.clear();
        self.relations.clear();
        self.features.clear();
    }

    /// Commit the batch: resolve merge identities, allocate fresh units, emit
    /// relations and features, all inside one store transaction. Units whose
    /// primary parent is not part of the batch fall back to
    /// `parent_if_missing`.
    pub fn finish_block(&mut self, parent_if_missing: Option<i64>, keep_uids: bool) -> Result<()> {
        let store = self.store;
        store.transaction(|| self.flush(parent_if_missing, keep_uids))
    }

    fn flush(&mut self, parent_if_missing: Option<i64>, keep_uids: bool) -> Result<()> {
        let store = self.store;
        let parent_type_if_missing = match parent_if_missing {
            Some(p) => Some(store.get_unit_type(p)?),
            None => None,
        };

        self.remap_features();
        let names: Vec<String> = self.names.iter().cloned().collect();
        let staged_features = std::mem::take(&mut self.features);
        let mut uids = self.uids.clone();
        let mut is_merged: HashSet<String> = HashSet::new();

        if !self.merge_on.is_empty() {
            let merge_possible = self.resolve_merges(&names, &staged_features)?;
            for (name, ids) in merge_possible {
                if let Some(first) = ids.first() {
                    uids.insert(name.clone(), *first);
                    is_merged.insert(name);
                }
            }
        }

        // Validate up front so an abandoned block leaves nothing behind even
        // inside an enclosing file transaction.
        for name in &names {
            if !uids.contains_key(name) && !self.types.contains_key(name) {
                return Err(Error::UntypedUnit(name.clone()));
            }
        }
        for name in &names {
            if uids.contains_key(name) {
                continue;
            }
            let unittype = &self.types[name];
            uids.insert(name.clone(), store.create_unit(unittype, Some(&self.user))?);
        }

        let now = store.now();
        {
            let mut relation = store.connection().prepare_cached(
                "INSERT OR IGNORE INTO relations
                 (parent, parent_type, child, child_type, isprimary, active, date)
                 VALUES (?, ?, ?, ?, ?, 1, ?)",
            )?;
            for name in &names {
                let child = uids[name];
                let child_type = self.types.get(name).cloned();
                let primary = self
                    .parents
                    .get(name)
                    .and_then(|p| uids.get(p).map(|id| (*id, self.types.get(p).cloned())))
                    .or_else(|| {
                        parent_if_missing.map(|p| (p, parent_type_if_missing.clone()))
                    });
                if let Some((parent, parent_type)) = primary {
                    relation.execute(params![
                        parent,
                        parent_type,
                        child,
                        child_type,
                        true,
                        now
                    ])?;
                }
                if let Some(extra) = self.relations.get(name) {
                    for rname in extra {
                        let rid = *uids
                            .get(rname)
                            .ok_or_else(|| Error::UnresolvedRef(rname.clone()))?;
                        let rtype = self.types.get(rname).cloned();
                        relation.execute(params![
                            rid,
                            rtype,
                            child,
                            child_type,
                            false,
                            now
                        ])?;
                    }
                }
            }
        }
        self.parents.clear();
        self.relations.clear();

        {
            let conn = store.connection();
            let mut insert = conn.prepare_cached(
                "INSERT INTO features (unit, feature, value, user, confidence, date)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )?;
            let mut update = conn.prepare_cached(
                "UPDATE features SET value = ?, user = ?, confidence = ?, date = ?
                 WHERE unit = ? AND feature = ?",
            )?;
            let mut upsert = conn.prepare_cached(
                "INSERT OR IGNORE INTO features (unit, feature, value, user, confidence, date)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )?;
            for name in &names {
                let feats = match staged_features.get(name) {
                    Some(feats) => feats,
                    None => continue,
                };
                let unittype = self
                    .types
                    .get(name)
                    .ok_or_else(|| Error::UntypedUnit(name.clone()))?
                    .clone();
                for ((feature, valuetype), (value, confidence)) in feats {
                    let fid = self.ensure_feature_id(&unittype, feature, *valuetype)?;
                    let value = match value {
                        StagedValue::Value(v) => v.clone(),
                        StagedValue::Ref(target) => Value::Int(
                            *uids
                                .get(target)
                                .ok_or_else(|| Error::UnresolvedRef(target.clone()))?,
                        ),
                    };
                    let unit = uids[name];
                    if is_merged.contains(name) {
                        update.execute(params![
                            value,
                            self.user,
                            confidence,
                            now,
                            unit,
                            fid
                        ])?;
                        upsert.execute(params![unit, fid, value, self.user, confidence, now])?;
                    } else {
                        insert.execute(params![unit, fid, value, self.user, confidence, now])?;
                    }
                }
            }
        }

        self.names.clear();
        if keep_uids {
            self.uids = uids;
        } else {
            self.uids.clear();
            self.types.clear();
        }
        self.blocks += 1;
        tracing::debug!(
            block = self.blocks,
            units = names.len(),
            merged = is_merged.len(),
            "flushed block"
        );
        Ok(())
    }

    /// Apply the configured feature mapping to the staged batch, preferring
    /// the entry typed with the unit's (already canonical) type.
    fn remap_features(&mut self) {
        if self.feature_map.is_empty() {
            return;
        }
        let features = std::mem::take(&mut self.features);
        for (name, feats) in features {
            let unittype = self.types.get(&name).cloned();
            let mut remapped = IndexMap::new();
            for ((feature, valuetype), staged) in feats {
                let feature = self
                    .feature_map
                    .get(&(feature.clone(), unittype.clone()))
                    .or_else(|| self.feature_map.get(&(feature.clone(), None)))
                    .cloned()
                    .unwrap_or(feature);
                remapped.insert((feature, valuetype), staged);
            }
            self.features.insert(name, remapped);
        }
    }

    /// Merge-on identity resolution: gather the batch's merge-key values,
    /// find existing units carrying them, then prune candidate lists until
    /// they are structurally consistent with the primary relations already in
    /// the store. Survivors merge onto their first remaining candidate.
    fn resolve_merges(
        &self,
        names: &[String],
        staged_features: &HashMap<String, IndexMap<FeatureKey, (StagedValue, Option<i64>)>>,
    ) -> Result<IndexMap<String, Vec<i64>>> {
        let store = self.store;

        // unit type → merge-key value → staged names carrying it
        let mut merge_values: IndexMap<String, IndexMap<Value, Vec<String>>> = IndexMap::new();
        for name in names {
            let unittype = match self.types.get(name) {
                Some(t) => t,
                None => continue,
            };
            let merge_feat = match self.merge_on.get(unittype) {
                Some(f) => f,
                None => continue,
            };
            if let Some(feats) = staged_features.get(name) {
                for ((feature, _), (value, _)) in feats {
                    if feature == merge_feat {
                        if let StagedValue::Value(v) = value {
                            merge_values
                                .entry(unittype.clone())
                                .or_default()
                                .entry(v.clone())
                                .or_default()
                                .push(name.clone());
                        }
                    }
                }
            }
        }

        let mut merge_possible: IndexMap<String, Vec<i64>> = IndexMap::new();
        for (unittype, val_map) in &merge_values {
            let merge_feat = &self.merge_on[unittype];
            let (fid, valuetype) = match store.get_feature_opt(unittype, merge_feat)? {
                Some(found) => found,
                None => continue,
            };
            let sql = format!(
                "SELECT f.unit, f.value FROM features f JOIN units u ON u.id = f.unit
                 WHERE u.type = ? AND u.active = 1 AND f.feature = ? AND f.value IN ({})
                 ORDER BY f.unit",
                placeholders(val_map.len())
            );
            let mut params: Vec<SqlValue> =
                vec![unittype.clone().into(), SqlValue::Integer(fid)];
            params.extend(val_map.keys().map(Value::to_sql_value));
            let mut stmt = store.connection().prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(params), |r| {
                Ok((r.get::<_, i64>(0)?, r.get::<_, SqlValue>(1)?))
            })?;
            for row in rows {
                let (unit, raw) = row?;
                let value = match Value::decode(raw, merge_feat, valuetype)? {
                    Some(v) => v,
                    None => continue,
                };
                if let Some(carriers) = val_map.get(&value) {
                    for name in carriers {
                        merge_possible.entry(name.clone()).or_default().push(unit);
                    }
                }
            }
        }

        // Structural consistency: a child may only merge onto a unit that is
        // already a primary child of one of its parent's candidates.
        let mut child_names: HashMap<String, Vec<String>> = HashMap::new();
        let mut all_merge: Vec<i64> = Vec::new();
        for name in names {
            if !merge_possible.contains_key(name) {
                continue;
            }
            all_merge.extend(merge_possible[name].iter().copied());
            let parent = match self.parents.get(name) {
                Some(p) => p,
                None => continue,
            };
            if !merge_possible.contains_key(parent) {
                merge_possible.swap_remove(name);
            }
            child_names
                .entry(parent.clone())
                .or_default()
                .push(name.clone());
        }

        let mut child_ids: HashMap<i64, HashSet<i64>> = HashMap::new();
        if !all_merge.is_empty() {
            let sql = format!(
                "SELECT parent, child FROM relations
                 WHERE active = 1 AND isprimary = 1 AND parent IN ({0}) AND child IN ({0})",
                placeholders(all_merge.len())
            );
            let mut params: Vec<SqlValue> =
                all_merge.iter().map(|u| SqlValue::Integer(*u)).collect();
            params.extend(all_merge.iter().map(|u| SqlValue::Integer(*u)));
            let mut stmt = store.connection().prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(params), |r| {
                Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (parent, child) = row?;
                child_ids.entry(parent).or_default().insert(child);
            }
        }

        let mut todo: Vec<String> = merge_possible.keys().cloned().collect();
        todo.sort();
        while !todo.is_empty() {
            let mut next_todo = Vec::new();
            for name in &todo {
                let candidates = match merge_possible.get(name) {
                    Some(c) => c.clone(),
                    None => continue,
                };
                let mut reachable: HashSet<i64> = HashSet::new();
                for candidate in &candidates {
                    if let Some(children) = child_ids.get(candidate) {
                        reachable.extend(children.iter().copied());
                    }
                }
                for child in child_names.get(name).cloned().unwrap_or_default() {
                    let child_candidates = match merge_possible.get(&child) {
                        Some(c) => c,
                        None => continue,
                    };
                    let pruned: Vec<i64> = child_candidates
                        .iter()
                        .filter(|c| reachable.contains(c))
                        .copied()
                        .collect();
                    if pruned.len() < child_candidates.len() {
                        merge_possible.insert(child.clone(), pruned);
                        next_todo.push(child);
                    }
                }
            }
            todo = next_todo;
        }

        Ok(merge_possible)
    }

    fn ensure_feature_id(
        &mut self,
        unittype: &str,
        feature: &str,
        valuetype: ValueType,
    ) -> Result<i64> {
        let key = (unittype.to_string(), feature.to_string());
        if let Some(id) = self.known_feats.get(&key) {
            return Ok(*id);
        }
        let id = match self.store.get_feature_opt(unittype, feature)? {
            Some((id, existing)) if existing == valuetype => id,
            Some((_, existing)) => {
                return Err(Error::FeatureTypeConflict {
                    name: feature.to_string(),
                    unittype: unittype.to_string(),
                    existing,
                })
            }
            None => self.store.create_feature(unittype, feature, valuetype)?,
        };
        self.known_feats.insert(key, id);
        Ok(id)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::create;

    fn stage_word(
        buffer: &mut StagingBuffer,
        name: &str,
        parent: &str,
        index: i64,
        form: &str,
    ) {
        buffer.set_type(name, "word");
        buffer.set_parent(name, parent);
        buffer
            .set_feature(name, "meta:index", ValueType::Int, Value::Int(index).into(), None)
            .unwrap();
        buffer
            .set_feature(name, "UD:form", ValueType::Str, Value::from(form).into(), None)
            .unwrap();
    }

    #[test]
    fn blocks_flush_units_relations_and_features() {
        let store = create(":memory:").unwrap();
        let mut buffer = StagingBuffer::new(&store, "tester");
        buffer.set_type("s", "sentence");
        stage_word(&mut buffer, "w1", "s", 1, "the");
        stage_word(&mut buffer, "w2", "s", 2, "man");
        buffer.finish_block(None, false).unwrap();

        let sentences = store.get_units("sentence", None).unwrap();
        assert_eq!(sentences.len(), 1);
        let words = store.get_units("word", Some(sentences[0])).unwrap();
        assert_eq!(words.len(), 2);
        let (form, _) = store.get_feature("word", "UD:form").unwrap();
        let values = store.get_feature_values(&words, &[form]).unwrap();
        assert_eq!(values[&words[0]], Value::Str("the".into()));
        assert_eq!(values[&words[1]], Value::Str("man".into()));
        assert_eq!(buffer.blocks(), 1);
    }

    #[test]
    fn untyped_units_abort_the_block() {
        let store = create(":memory:").unwrap();
        let mut buffer = StagingBuffer::new(&store, "tester");
        buffer.set_parent("w1", "s");
        assert!(matches!(
            buffer.finish_block(None, false),
            Err(Error::UntypedUnit(_))
        ));
        // The failed flush rolled back; nothing was written.
        assert_eq!(store.get_units("sentence", None).unwrap(), Vec::<i64>::new());
    }

    #[test]
    fn ref_features_resolve_to_block_units() {
        let store = create(":memory:").unwrap();
        let mut buffer = StagingBuffer::new(&store, "tester");
        buffer.set_type("s", "sentence");
        stage_word(&mut buffer, "w1", "s", 1, "dogs");
        stage_word(&mut buffer, "w2", "s", 2, "bark");
        buffer
            .set_feature(
                "w1",
                "UD:head",
                ValueType::Ref,
                StagedValue::Ref("w2".to_string()),
                None,
            )
            .unwrap();
        buffer.finish_block(None, false).unwrap();

        let sentences = store.get_units("sentence", None).unwrap();
        let words = store.get_units("word", Some(sentences[0])).unwrap();
        let (head, _) = store.get_feature("word", "UD:head").unwrap();
        assert_eq!(
            store.get_feature_value(words[0], head).unwrap(),
            Some(Value::Int(words[1]))
        );
    }

    #[test]
    fn secondary_relations_are_emitted() {
        let store = create(":memory:").unwrap();
        let mut buffer = StagingBuffer::new(&store, "tester");
        buffer.set_type("s", "sentence");
        stage_word(&mut buffer, "w1", "s", 1, "a");
        stage_word(&mut buffer, "w2", "s", 2, "b");
        buffer.add_relation("w1", "w2");
        buffer.finish_block(None, false).unwrap();

        let sentences = store.get_units("sentence", None).unwrap();
        let words = store.get_units("word", Some(sentences[0])).unwrap();
        // Primary parent is the sentence, not the secondary target.
        assert_eq!(store.get_parent(words[0]).unwrap(), Some(sentences[0]));
        let n: i64 = store
            .connection()
            .query_row(
                "SELECT COUNT(*) FROM relations
                 WHERE child = ? AND isprimary = 0 AND active = 1",
                [words[0]],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(n, 1);
    }

    fn import_text_block(store: &Store, features: &[(&str, &str)]) {
        // Two phrases of two words each per call; `features` lists
        // (feature, prefix) pairs to attach to every word.
        let mut buffer = StagingBuffer::new(store, "tester");
        buffer.set_merge_on(
            [
                ("phrase".to_string(), "meta:index".to_string()),
                ("word".to_string(), "meta:index".to_string()),
            ]
            .into_iter()
            .collect(),
        );
        for p in 0..2 {
            let pname = format!("p{}", p);
            buffer.set_type(&pname, "phrase");
            buffer
                .set_feature(&pname, "meta:index", ValueType::Int, Value::Int(p).into(), None)
                .unwrap();
            for w in 0..2 {
                let wname = format!("p{}w{}", p, w);
                buffer.set_type(&wname, "word");
                buffer.set_parent(&wname, &pname);
                buffer
                    .set_feature(
                        &wname,
                        "meta:index",
                        ValueType::Int,
                        Value::Int(w).into(),
                        None,
                    )
                    .unwrap();
                for (feature, prefix) in features {
                    buffer
                        .set_feature(
                            &wname,
                            feature,
                            ValueType::Str,
                            Value::from(format!("{}{}{}", prefix, p, w)).into(),
                            None,
                        )
                        .unwrap();
                }
            }
        }
        buffer.finish_block(None, false).unwrap();
    }

    #[test]
    fn merge_on_folds_a_second_import_onto_the_first() {
        let store = create(":memory:").unwrap();
        import_text_block(&store, &[("txt:en", "t")]);
        import_text_block(&store, &[("pos:en", "p")]);

        // Unit counts match a single import.
        assert_eq!(store.get_units("phrase", None).unwrap().len(), 2);
        let words = store.get_units("word", None).unwrap();
        assert_eq!(words.len(), 4);

        // Every word carries both features.
        let (txt, _) = store.get_feature("word", "txt:en").unwrap();
        let (pos, _) = store.get_feature("word", "pos:en").unwrap();
        let txts = store.get_feature_values(&words, &[txt]).unwrap();
        let poss = store.get_feature_values(&words, &[pos]).unwrap();
        assert_eq!(txts.len(), 4);
        assert_eq!(poss.len(), 4);
        // Structural pruning matched words to their own phrase: the text
        // and pos suffixes agree per unit.
        for unit in &words {
            let t = txts[unit].as_str().unwrap().trim_start_matches('t');
            let p = poss[unit].as_str().unwrap().trim_start_matches('p');
            assert_eq!(t, p);
        }
    }

    #[test]
    fn merge_is_idempotent() {
        let store = create(":memory:").unwrap();
        import_text_block(&store, &[("txt:en", "t")]);
        let once = (
            store.get_units("phrase", None).unwrap(),
            store.get_units("word", None).unwrap(),
        );
        import_text_block(&store, &[("txt:en", "t")]);
        let twice = (
            store.get_units("phrase", None).unwrap(),
            store.get_units("word", None).unwrap(),
        );
        assert_eq!(once, twice);
    }

    #[test]
    fn mapping_renames_staged_types_and_features() {
        let store = create(":memory:").unwrap();
        let specs: Vec<crate::MappingSpec> = serde_json::from_value(serde_json::json!([
            {"in_type": "word", "out_type": "token"},
            {"in_feature": "morph:POS", "out_feature": "UD:upos", "in_type": "word"},
        ]))
        .unwrap();
        let mapping = Mapping::from_specs(&specs).unwrap();
        let mut buffer = StagingBuffer::new(&store, "tester");
        buffer.set_mapping(&mapping);
        buffer.set_type("t1", "token");
        buffer
            .set_feature("t1", "UD:upos", ValueType::Str, Value::from("NOUN").into(), None)
            .unwrap();
        buffer.finish_block(None, false).unwrap();

        let words = store.get_units("word", None).unwrap();
        assert_eq!(words.len(), 1);
        let (pos, _) = store.get_feature("word", "morph:POS").unwrap();
        assert_eq!(
            store.get_feature_value(words[0], pos).unwrap(),
            Some(Value::Str("NOUN".into()))
        );
    }
}
