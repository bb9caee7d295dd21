//! Build metadata side channel: compiler flags and library dependencies
//! collected from components and jobs, handed to an external flag assembler.
use indexmap::{IndexMap, IndexSet};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Library {
    pub name: String,
    pub version: Option<String>,
}

impl Library {
    pub fn new(name: &str, version: Option<&str>) -> Self {
        Self { name: name.to_string(), version: version.map(str::to_string) }
    }
}

/// Insertion-ordered, de-duplicated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildInfo {
    pub flags: IndexSet<String>,
    pub libraries: IndexMap<String, Option<String>>,
}

impl BuildInfo {
    pub fn add_flag(&mut self, flag: &str) {
        self.flags.insert(flag.to_string());
    }

    /// First version requested for a library wins; a conflicting later one is logged.
    pub fn add_library(&mut self, lib: &Library) {
        match self.libraries.get(&lib.name) {
            None => {
                self.libraries.insert(lib.name.clone(), lib.version.clone());
            }
            Some(existing) if existing != &lib.version => {
                tracing::warn!(
                    library = %lib.name,
                    kept = ?existing,
                    ignored = ?lib.version,
                    "conflicting library versions requested"
                );
            }
            Some(_) => {}
        }
    }

    /// `name@version` entries, PlatformIO `lib_deps` style.
    pub fn lib_deps(&self) -> Vec<String> {
        self.libraries
            .iter()
            .map(|(name, v)| match v {
                Some(v) => format!("{name}@{v}"),
                None => name.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedups_and_keeps_first_version() {
        let mut b = BuildInfo::default();
        b.add_flag("-DUSE_UART");
        b.add_flag("-DUSE_UART");
        b.add_library(&Library::new("SPI", None));
        b.add_library(&Library::new("teemuatlut/TMCStepper", Some("0.7.1")));
        b.add_library(&Library::new("teemuatlut/TMCStepper", Some("0.8.0")));
        assert_eq!(b.flags.len(), 1);
        assert_eq!(b.lib_deps(), ["SPI", "teemuatlut/TMCStepper@0.7.1"]);
    }
}
