use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Audio Unit component code triple (type, subtype, manufacturer).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentId {
    #[serde(rename = "type")]
    pub au_type: String,
    pub subtype: String,
    pub manufacturer: String,
}

impl ComponentId {
    pub fn new(
        au_type: impl Into<String>,
        subtype: impl Into<String>,
        manufacturer: impl Into<String>,
    ) -> Self {
        Self {
            au_type: au_type.into(),
            subtype: subtype.into(),
            manufacturer: manufacturer.into(),
        }
    }

    /// File stem of this component's record in the host's Tags directory.
    pub fn tagset_name(&self) -> String {
        format!(
            "{}-{}-{}",
            hex_code(&self.au_type),
            hex_code(&self.subtype),
            hex_code(&self.manufacturer)
        )
    }
}

fn hex_code(code: &str) -> String {
    code.bytes().map(|b| format!("{:02x}", b)).collect()
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.au_type, self.subtype, self.manufacturer)
    }
}

impl FromStr for ComponentId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [t, st, m] if !t.is_empty() && !st.is_empty() && !m.is_empty() => {
                Ok(ComponentId::new(*t, *st, *m))
            }
            _ => Err(format!("expected type:subtype:manufacturer, got {:?}", s)),
        }
    }
}

/// One installed plugin as reported by discovery. Read-only everywhere else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginIdentity {
    pub name: String,
    pub vendor: String,
    pub component: ComponentId,
    #[serde(default)]
    pub bundle_id: String,
    #[serde(default)]
    pub path: PathBuf,
}

impl PluginIdentity {
    pub fn new(name: impl Into<String>, vendor: impl Into<String>, component: ComponentId) -> Self {
        Self {
            name: name.into(),
            vendor: vendor.into(),
            component,
            bundle_id: String::new(),
            path: PathBuf::new(),
        }
    }

    pub fn with_bundle_id(mut self, bundle_id: impl Into<String>) -> Self {
        self.bundle_id = bundle_id.into();
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }
}
