//! Rewriting matched annotation: a transformation program pairs a query with
//! a sequence of commands applied once per match. Commands are validated at
//! construction (deserialization) and write through the store under the
//! caller's user and confidence.

use corpus::{Mapping, Store, Value, ValueType};
use query::{search, Binding, Query};
use serde::Deserialize;
use std::collections::HashMap;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no unit bound to '{0}' in this match")]
    UnboundName(String),
    #[error("'{0}' is bound to several units; commands need a single target")]
    ListBinding(String),
    #[error(transparent)]
    Query(#[from] query::Error),
    #[error(transparent)]
    Corpus(#[from] corpus::Error),
}

/// The closed command set. Field presence and value shapes are enforced by
/// deserialization, so a program that parses is structurally sound before
/// any match is visited.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum Command {
    CreateFeature {
        unit_type: String,
        feature: String,
        value_type: ValueType,
    },
    SetFeature {
        target: String,
        feature: String,
        value: Value,
    },
    SetRefFeature {
        target: String,
        feature: String,
        /// Match name whose unit id becomes the stored value.
        value: String,
    },
    /// Copy a feature between units, optionally adjusting it: `add` shifts
    /// integer values, `prepend`/`append` wrap string values. A missing or
    /// non-matching source value makes the command a no-op.
    CopyFeature {
        source: String,
        source_feature: String,
        target: String,
        target_feature: String,
        #[serde(default)]
        add: Option<i64>,
        #[serde(default)]
        prepend: Option<String>,
        #[serde(default)]
        append: Option<String>,
    },
    RemoveFeature {
        target: String,
        feature: String,
    },
    CreateUnit {
        unit_type: String,
        /// Name the new unit binds to for the rest of this match.
        unit_name: String,
    },
    RemoveUnit {
        target: String,
    },
    SetParent {
        parent: String,
        child: String,
    },
    RemoveParent {
        parent: String,
        child: String,
    },
    SetRelation {
        parent: String,
        child: String,
    },
    RemoveRelation {
        parent: String,
        child: String,
    },
}

/// A query plus the commands to run on each of its matches.
#[derive(Debug, Clone)]
pub struct Program {
    pub query: Query,
    pub commands: Vec<Command>,
}

fn lookup(bound: &HashMap<String, i64>, name: &str) -> Result<i64> {
    bound
        .get(name)
        .copied()
        .ok_or_else(|| Error::UnboundName(name.to_string()))
}

fn apply_command(
    store: &Store,
    mapping: &Mapping,
    command: &Command,
    bound: &mut HashMap<String, i64>,
    user: &str,
    confidence: i64,
) -> Result<()> {
    match command {
        Command::CreateFeature {
            unit_type,
            feature,
            value_type,
        } => {
            let stored_type = mapping.map_type(unit_type);
            let stored_feature = mapping.map_feature(feature, std::slice::from_ref(unit_type));
            store.create_feature(&stored_type, &stored_feature, *value_type)?;
        }
        Command::SetFeature {
            target,
            feature,
            value,
        } => {
            let unit = lookup(bound, target)?;
            let feature = mapped_feature(store, mapping, unit, feature)?;
            store.set_feature(unit, &feature, value, user, confidence)?;
        }
        Command::SetRefFeature {
            target,
            feature,
            value,
        } => {
            let unit = lookup(bound, target)?;
            let other = lookup(bound, value)?;
            let feature = mapped_feature(store, mapping, unit, feature)?;
            store.set_feature(unit, &feature, &Value::Int(other), user, confidence)?;
        }
        Command::CopyFeature {
            source,
            source_feature,
            target,
            target_feature,
            add,
            prepend,
            append,
        } => {
            let from = lookup(bound, source)?;
            let to = lookup(bound, target)?;
            let from_type = store.get_unit_type(from)?;
            let source_feature = mapped_feature(store, mapping, from, source_feature)?;
            let (fid, _) = store.get_feature(&from_type, &source_feature)?;
            let value = match store.get_feature_value(from, fid)? {
                Some(value) => value,
                None => return Ok(()),
            };
            let adjusted = match value {
                Value::Int(i) if prepend.is_none() && append.is_none() => {
                    Value::Int(i + add.unwrap_or(0))
                }
                Value::Str(s) if add.is_none() => {
                    let mut out = prepend.clone().unwrap_or_default();
                    out.push_str(&s);
                    out.push_str(append.as_deref().unwrap_or(""));
                    Value::Str(out)
                }
                // A value the adjuncts cannot apply to: leave it alone only
                // when an adjunct was requested, otherwise copy verbatim.
                other => {
                    if add.is_some() || prepend.is_some() || append.is_some() {
                        return Ok(());
                    }
                    other
                }
            };
            let to_type = store.get_unit_type(to)?;
            let target_feature = mapped_feature(store, mapping, to, target_feature)?;
            let value_type = match &adjusted {
                Value::Int(_) => ValueType::Int,
                Value::Bool(_) => ValueType::Bool,
                Value::Str(_) => ValueType::Str,
            };
            store.create_feature(&to_type, &target_feature, value_type)?;
            store.set_feature(to, &target_feature, &adjusted, user, confidence)?;
        }
        Command::RemoveFeature { target, feature } => {
            let unit = lookup(bound, target)?;
            let feature = mapped_feature(store, mapping, unit, feature)?;
            store.rem_feature(unit, &feature)?;
        }
        Command::CreateUnit {
            unit_type,
            unit_name,
        } => {
            let stored_type = mapping.map_type(unit_type);
            let unit = store.create_unit(&stored_type, Some(user))?;
            bound.insert(unit_name.clone(), unit);
        }
        Command::RemoveUnit { target } => {
            let unit = lookup(bound, target)?;
            store.rem_unit(unit, user)?;
        }
        Command::SetParent { parent, child } => {
            store.set_parent(lookup(bound, parent)?, lookup(bound, child)?, true, true)?;
        }
        Command::RemoveParent { parent, child } => {
            store.rem_parent(lookup(bound, parent)?, lookup(bound, child)?, true)?;
        }
        Command::SetRelation { parent, child } => {
            store.set_parent(lookup(bound, parent)?, lookup(bound, child)?, false, true)?;
        }
        Command::RemoveRelation { parent, child } => {
            store.rem_parent(lookup(bound, parent)?, lookup(bound, child)?, false)?;
        }
    }
    Ok(())
}

/// Translate a command's feature name through the mapping for the unit's
/// (outward) type.
fn mapped_feature(
    store: &Store,
    mapping: &Mapping,
    unit: i64,
    feature: &str,
) -> Result<String> {
    let stored_type = store.get_unit_type(unit)?;
    let source_type = mapping.invert().map_type(&stored_type);
    Ok(mapping.map_feature(feature, &[source_type]))
}

/// Run `program` against the store: every match of its query receives the
/// commands in source order, inside one shared transaction. A failing
/// command abandons the rest of its match; with `fatal` it aborts the whole
/// program (and the transaction with it).
pub fn apply(
    store: &Store,
    mapping: &Mapping,
    program: &Program,
    user: &str,
    confidence: i64,
    fatal: bool,
) -> Result<u64> {
    store.transaction(|| {
        let mut applied = 0u64;
        for m in search(store, mapping, &program.query)? {
            let mut bound: HashMap<String, i64> = HashMap::new();
            for (name, binding) in &m.bindings {
                if let Binding::One(id) = binding {
                    bound.insert(name.clone(), *id);
                }
            }
            for command in &program.commands {
                match apply_command(store, mapping, command, &mut bound, user, confidence) {
                    Ok(()) => applied += 1,
                    Err(err) if fatal => return Err(err),
                    Err(err) => {
                        tracing::error!(error = %err, "command failed; abandoning this match");
                        break;
                    }
                }
            }
        }
        Ok(applied)
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use corpus::{StagingBuffer, Value};
    use query::parse_query;

    fn commands(value: serde_json::Value) -> Vec<Command> {
        serde_json::from_value(value).unwrap()
    }

    fn fixture() -> corpus::Store {
        let store = corpus::create(":memory:").unwrap();
        let mut buffer = StagingBuffer::new(&store, "tester");
        buffer.set_type("s", "sentence");
        for (i, (form, upos, lemma)) in [
            ("He", "PRON", "he"),
            ("kicks", "VERB", "kick"),
            ("balls", "NOUN", "ball"),
        ]
        .iter()
        .enumerate()
        {
            let w = format!("w{}", i);
            buffer.set_type(&w, "word");
            buffer.set_parent(&w, "s");
            buffer
                .set_feature(&w, "meta:index", ValueType::Int, Value::Int(i as i64).into(), None)
                .unwrap();
            for (feature, value) in [("UD:form", form), ("UD:upos", upos), ("UD:lemma", lemma)] {
                buffer
                    .set_feature(&w, feature, ValueType::Str, Value::from(*value).into(), None)
                    .unwrap();
            }
        }
        buffer.finish_block(None, false).unwrap();
        store
    }

    fn object_query() -> Query {
        parse_query(
            "unit S sentence\n\
             unit Verb word\n\
             unit Obj word\n\
             Verb parent S\n\
             Obj parent S\n\
             Verb.UD:upos = \"VERB\"\n\
             Verb.meta:index + 1 = Obj.meta:index\n",
        )
        .unwrap()
    }

    #[test]
    fn commands_validate_at_construction() {
        assert!(serde_json::from_value::<Vec<Command>>(serde_json::json!([
            {"type": "set_feature", "target": "Obj", "feature": "UD:upos", "value": "NOUN"},
        ]))
        .is_ok());
        // Unknown command tag.
        assert!(serde_json::from_value::<Vec<Command>>(serde_json::json!([
            {"type": "set_everything"},
        ]))
        .is_err());
        // Missing parameter.
        assert!(serde_json::from_value::<Vec<Command>>(serde_json::json!([
            {"type": "set_feature", "target": "Obj"},
        ]))
        .is_err());
        // Stray parameter.
        assert!(serde_json::from_value::<Vec<Command>>(serde_json::json!([
            {"type": "remove_unit", "target": "Obj", "feature": "UD:upos"},
        ]))
        .is_err());
    }

    #[test]
    fn set_feature_writes_once_per_match() {
        let store = fixture();
        let program = Program {
            query: object_query(),
            commands: commands(serde_json::json!([
                {"type": "set_feature", "target": "Obj", "feature": "UD:upos", "value": "NOUN"},
            ])),
        };
        apply(&store, &Mapping::default(), &program, "editor", 1, true).unwrap();
        let words = store.get_units("word", None).unwrap();
        let (upos, _) = store.get_feature("word", "UD:upos").unwrap();
        assert_eq!(
            store.get_feature_value(words[2], upos).unwrap(),
            Some(Value::Str("NOUN".into()))
        );
        // Still exactly one authoritative row.
        let n: i64 = store
            .connection()
            .query_row(
                "SELECT COUNT(*) FROM features WHERE unit = ? AND feature = ?",
                [words[2], upos],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn copy_feature_adjusts_strings_and_skips_mismatches() {
        let store = fixture();
        let program = Program {
            query: object_query(),
            commands: commands(serde_json::json!([
                {"type": "copy_feature", "source": "Verb", "source_feature": "UD:lemma",
                 "target": "Obj", "target_feature": "nlp:form", "append": "-ing"},
                {"type": "copy_feature", "source": "Verb", "source_feature": "meta:index",
                 "target": "Obj", "target_feature": "nlp:verb_index", "append": "-oops"},
            ])),
        };
        apply(&store, &Mapping::default(), &program, "editor", 1, true).unwrap();
        let words = store.get_units("word", None).unwrap();
        let (form, _) = store.get_feature("word", "nlp:form").unwrap();
        assert_eq!(
            store.get_feature_value(words[2], form).unwrap(),
            Some(Value::Str("kick-ing".into()))
        );
        // The string adjunct on an int source did nothing, not even create
        // the feature.
        assert!(store.get_feature_opt("word", "nlp:verb_index").unwrap().is_none());
    }

    #[test]
    fn created_units_bind_for_later_commands() {
        let store = fixture();
        let program = Program {
            query: object_query(),
            commands: commands(serde_json::json!([
                {"type": "create_unit", "unit_type": "annotation", "unit_name": "Note"},
                {"type": "set_parent", "parent": "Obj", "child": "Note"},
                {"type": "set_ref_feature", "target": "Obj", "feature": "nlp:note", "value": "Note"},
            ])),
        };
        store
            .create_feature("word", "nlp:note", ValueType::Ref)
            .unwrap();
        apply(&store, &Mapping::default(), &program, "editor", 1, true).unwrap();
        let notes = store.get_units("annotation", None).unwrap();
        assert_eq!(notes.len(), 1);
        let words = store.get_units("word", None).unwrap();
        assert_eq!(store.get_parent(notes[0]).unwrap(), Some(words[2]));
        let (note, _) = store.get_feature("word", "nlp:note").unwrap();
        assert_eq!(
            store.get_feature_value(words[2], note).unwrap(),
            Some(Value::Int(notes[0]))
        );
    }

    #[test]
    fn unbound_names_fail_or_skip_by_configuration() {
        let store = fixture();
        let program = Program {
            query: object_query(),
            commands: commands(serde_json::json!([
                {"type": "remove_unit", "target": "Nobody"},
                {"type": "set_feature", "target": "Obj", "feature": "UD:upos", "value": "X"},
            ])),
        };
        assert!(matches!(
            apply(&store, &Mapping::default(), &program, "editor", 1, true),
            Err(Error::UnboundName(_))
        ));
        // Non-fatal: the bad command abandons its match but the program
        // finishes, and the fatal run above rolled its writes back.
        let applied = apply(&store, &Mapping::default(), &program, "editor", 1, false).unwrap();
        assert_eq!(applied, 0);
        let words = store.get_units("word", None).unwrap();
        let (upos, _) = store.get_feature("word", "UD:upos").unwrap();
        assert_eq!(
            store.get_feature_value(words[2], upos).unwrap(),
            Some(Value::Str("NOUN".into()))
        );
    }

    #[test]
    fn relations_edit_both_ways() {
        let store = fixture();
        let words = store.get_units("word", None).unwrap();
        let program = Program {
            query: object_query(),
            commands: commands(serde_json::json!([
                {"type": "set_relation", "parent": "Verb", "child": "Obj"},
            ])),
        };
        apply(&store, &Mapping::default(), &program, "editor", 1, true).unwrap();
        let n: i64 = store
            .connection()
            .query_row(
                "SELECT COUNT(*) FROM relations
                 WHERE parent = ? AND child = ? AND isprimary = 0 AND active = 1",
                [words[1], words[2]],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(n, 1);
        // The primary parent is untouched.
        let sentences = store.get_units("sentence", None).unwrap();
        assert_eq!(store.get_parent(words[2]).unwrap(), Some(sentences[0]));

        let undo = Program {
            query: object_query(),
            commands: commands(serde_json::json!([
                {"type": "remove_relation", "parent": "Verb", "child": "Obj"},
            ])),
        };
        apply(&store, &Mapping::default(), &undo, "editor", 1, true).unwrap();
        let n: i64 = store
            .connection()
            .query_row(
                "SELECT COUNT(*) FROM relations
                 WHERE parent = ? AND child = ? AND active = 1",
                [words[1], words[2]],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(n, 0);
    }
}
