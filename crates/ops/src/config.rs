//! Process parameter resolution over a nested configuration document. The
//! chain for each parameter is: explicit override, then
//! `conf[process][param]`, then `conf[param]`, then the declared default;
//! missing required parameters are errors naming both the parameter and the
//! process.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde_json::Value as Json;

#[derive(Debug, Clone, Default)]
pub struct Config {
    document: Json,
    overrides: serde_json::Map<String, Json>,
}

impl Config {
    pub fn new(document: Json) -> Config {
        Config {
            document,
            overrides: serde_json::Map::new(),
        }
    }

    pub fn empty() -> Config {
        Config::new(Json::Object(Default::default()))
    }

    /// Set an explicit call-time value for a parameter. Overrides win over
    /// every lookup in the document, for every process.
    pub fn set_override(&mut self, name: impl Into<String>, value: Json) {
        self.overrides.insert(name.into(), value);
    }

    fn get(&self, process: &str, name: &str) -> Option<&Json> {
        self.overrides
            .get(name)
            .or_else(|| self.document.get(process).and_then(|section| section.get(name)))
            .or_else(|| self.document.get(name))
    }

    /// Resolve an optional parameter for `process`.
    pub fn param<T: DeserializeOwned>(&self, process: &str, name: &str) -> Result<Option<T>> {
        match self.get(process, name) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(|err| {
                Error::InvalidParameter {
                    process: process.to_string(),
                    name: name.to_string(),
                    detail: err.to_string(),
                }
            }),
        }
    }

    /// Resolve a required parameter for `process`.
    pub fn required<T: DeserializeOwned>(&self, process: &str, name: &str) -> Result<T> {
        self.param(process, name)?
            .ok_or_else(|| Error::MissingParameter {
                process: process.to_string(),
                name: name.to_string(),
            })
    }

    pub fn param_or<T: DeserializeOwned>(
        &self,
        process: &str,
        name: &str,
        default: T,
    ) -> Result<T> {
        Ok(self.param(process, name)?.unwrap_or(default))
    }

    /// The username attributed to a process's writes: the `username`
    /// parameter, the `USER` environment variable, or `script`.
    pub fn username(&self, process: &str) -> Result<String> {
        match self.param::<String>(process, "username")? {
            Some(user) => Ok(user),
            None => Ok(std::env::var("USER").unwrap_or_else(|_| "script".to_string())),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn fixture() -> Config {
        Config::new(json!({
            "db": "top.db",
            "width": 3,
            "import": {"db": "import.db", "mode": "toy"},
        }))
    }

    #[test]
    fn process_sections_shadow_top_level_keys() {
        let conf = fixture();
        assert_eq!(
            conf.required::<String>("import", "db").unwrap(),
            "import.db"
        );
        assert_eq!(conf.required::<String>("export", "db").unwrap(), "top.db");
        assert_eq!(conf.required::<i64>("export", "width").unwrap(), 3);
    }

    #[test]
    fn explicit_overrides_beat_every_document_leg() {
        let mut conf = fixture();
        conf.set_override("db", json!("override.db"));
        // Beats the process section…
        assert_eq!(
            conf.required::<String>("import", "db").unwrap(),
            "override.db"
        );
        // …and the top-level key.
        assert_eq!(
            conf.required::<String>("export", "db").unwrap(),
            "override.db"
        );
        // Unrelated parameters still resolve through the document.
        assert_eq!(conf.required::<String>("import", "mode").unwrap(), "toy");
    }

    #[test]
    fn missing_and_mistyped_parameters_are_named() {
        let conf = fixture();
        let err = conf.required::<String>("export", "outfile").unwrap_err();
        assert!(matches!(
            err,
            Error::MissingParameter { ref process, ref name }
                if process == "export" && name == "outfile"
        ));
        assert!(matches!(
            conf.required::<i64>("import", "db"),
            Err(Error::InvalidParameter { .. })
        ));
        assert_eq!(conf.param_or("export", "width", 2).unwrap(), 3);
        assert_eq!(conf.param_or("export", "depth", 2).unwrap(), 2);
    }
}
