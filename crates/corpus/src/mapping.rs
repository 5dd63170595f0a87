use crate::value::split_feature;
use crate::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;

/// One boundary mapping entry. `in_*` names the stored (canonical)
/// vocabulary, `out_*` the external format's vocabulary. An entry with only
/// types is a type rename; an entry with features renames a feature,
/// optionally restricted to a type pair.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MappingSpec {
    pub in_type: Option<String>,
    pub out_type: Option<String>,
    pub in_feature: Option<String>,
    pub out_feature: Option<String>,
}

/// The two bijections of the conversion boundary: a type rename and a
/// feature rename, held in the external → stored direction. [`Mapping::invert`]
/// yields the way-out translation. A feature entry carrying a type wins over
/// an untyped entry for the same feature name.
#[derive(Debug, Clone, Default)]
pub struct Mapping {
    pub(crate) types: HashMap<String, String>,
    pub(crate) feats: HashMap<(String, Option<String>), (String, Option<String>)>,
}

impl Mapping {
    pub fn from_specs(specs: &[MappingSpec]) -> Result<Mapping> {
        let mut mapping = Mapping::default();
        // Type renames first, so feature entries can infer their paired type.
        for spec in specs {
            if spec.in_feature.is_some() || spec.out_feature.is_some() {
                continue;
            }
            match (&spec.in_type, &spec.out_type) {
                (Some(stored), Some(source)) => {
                    mapping.types.insert(source.clone(), stored.clone());
                }
                _ => {
                    return Err(Error::InvalidMapping(
                        "a type entry needs both in_type and out_type".to_string(),
                    ))
                }
            }
        }
        for spec in specs {
            let (stored, source) = match (&spec.in_feature, &spec.out_feature) {
                (None, None) => continue,
                (Some(i), Some(o)) => (i.clone(), o.clone()),
                _ => {
                    return Err(Error::InvalidMapping(
                        "a feature entry needs both in_feature and out_feature".to_string(),
                    ))
                }
            };
            split_feature(&stored)?;
            split_feature(&source)?;
            let mut in_type = spec.in_type.clone();
            let mut out_type = spec.out_type.clone();
            // A type given on only one side is carried across through the
            // type map.
            if out_type.is_none() {
                out_type = in_type.as_ref().map(|t| mapping.source_type(t));
            }
            if in_type.is_none() {
                in_type = out_type.as_ref().map(|t| mapping.map_type(t));
            }
            mapping
                .feats
                .insert((source, out_type), (stored, in_type));
        }
        Ok(mapping)
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty() && self.feats.is_empty()
    }

    /// External type name → stored type name (identity when unmapped).
    pub fn map_type(&self, unittype: &str) -> String {
        self.types
            .get(unittype)
            .cloned()
            .unwrap_or_else(|| unittype.to_string())
    }

    pub fn map_types(&self, unittypes: &[String]) -> Vec<String> {
        unittypes.iter().map(|t| self.map_type(t)).collect()
    }

    /// Stored type name → external type name.
    pub fn source_type(&self, unittype: &str) -> String {
        self.types
            .iter()
            .find(|(_, stored)| stored.as_str() == unittype)
            .map(|(source, _)| source.clone())
            .unwrap_or_else(|| unittype.to_string())
    }

    /// External feature name → stored feature name, trying each of the
    /// variable's external types before the untyped entry.
    pub fn map_feature(&self, feature: &str, source_types: &[String]) -> String {
        for unittype in source_types {
            if let Some((stored, _)) =
                self.feats.get(&(feature.to_string(), Some(unittype.clone())))
            {
                return stored.clone();
            }
        }
        if let Some((stored, _)) = self.feats.get(&(feature.to_string(), None)) {
            return stored.clone();
        }
        feature.to_string()
    }

    /// The stored → external direction of both maps.
    pub fn invert(&self) -> Mapping {
        Mapping {
            types: self
                .types
                .iter()
                .map(|(source, stored)| (stored.clone(), source.clone()))
                .collect(),
            feats: self
                .feats
                .iter()
                .map(|(source, stored)| (stored.clone(), source.clone()))
                .collect(),
        }
    }

    /// Feature entries as ((external feature, external type?), (stored
    /// feature, stored type?)) pairs.
    pub fn feature_entries(
        &self,
    ) -> impl Iterator<Item = (&(String, Option<String>), &(String, Option<String>))> {
        self.feats.iter()
    }

    /// The lookup table the staging buffer applies to a finished block:
    /// (external feature name, stored unit type) → stored feature name. The
    /// buffer's types are already canonical by the time features flush, so
    /// the key mixes vocabularies deliberately.
    pub fn import_feature_map(&self) -> HashMap<(String, Option<String>), String> {
        self.feats
            .iter()
            .map(|((source_feat, _), (stored_feat, stored_type))| {
                ((source_feat.clone(), stored_type.clone()), stored_feat.clone())
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn fixture() -> Mapping {
        let specs: Vec<MappingSpec> = serde_json::from_value(serde_json::json!([
            {"in_type": "word", "out_type": "token"},
            {"in_feature": "morph:POS", "out_feature": "UD:upos", "in_type": "word"},
            {"in_feature": "misc:gloss", "out_feature": "gloss:en"},
        ]))
        .unwrap();
        Mapping::from_specs(&specs).unwrap()
    }

    #[test]
    fn types_rename_in_both_directions() {
        let mapping = fixture();
        assert_eq!(mapping.map_type("token"), "word");
        assert_eq!(mapping.map_type("sentence"), "sentence");
        assert_eq!(mapping.invert().map_type("word"), "token");
    }

    #[test]
    fn feature_entries_infer_the_paired_type() {
        let mapping = fixture();
        // in_type "word" was given alone; the external side follows the type
        // map back to "token".
        assert_eq!(
            mapping.map_feature("UD:upos", &["token".to_string()]),
            "morph:POS"
        );
        // Untyped entries match any type.
        assert_eq!(
            mapping.map_feature("gloss:en", &["sentence".to_string()]),
            "misc:gloss"
        );
        assert_eq!(
            mapping.map_feature("UD:upos", &["sentence".to_string()]),
            "UD:upos"
        );
    }

    #[test]
    fn inversion_round_trips() {
        let mapping = fixture();
        let back = mapping.invert().invert();
        assert_eq!(
            back.map_feature("UD:upos", &["token".to_string()]),
            "morph:POS"
        );
        assert_eq!(back.map_type("token"), "word");
    }

    #[test]
    fn import_table_is_keyed_by_stored_type() {
        let mapping = fixture();
        let table = mapping.import_feature_map();
        assert_eq!(
            table.get(&("UD:upos".to_string(), Some("word".to_string()))),
            Some(&"morph:POS".to_string())
        );
        assert_eq!(
            table.get(&("gloss:en".to_string(), None)),
            Some(&"misc:gloss".to_string())
        );
    }

    #[test]
    fn malformed_entries_are_rejected() {
        let specs = vec![MappingSpec {
            in_type: Some("word".to_string()),
            ..Default::default()
        }];
        assert!(matches!(
            Mapping::from_specs(&specs),
            Err(Error::InvalidMapping(_))
        ));
    }
}
