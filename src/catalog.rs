//! The set of store commands the proxy accepts.
//!
//! Built once at startup from the store's own command table, filtered to the
//! configured allow-list, and never mutated afterwards. Lookups are plain
//! `HashMap` reads, so the catalog can be shared behind an `Arc` without locks.

use std::collections::{BTreeSet, HashMap};

use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDescriptor {
    pub name: String,
    /// `N > 0`: exactly `N` tokens (command name included). `-N`: at least `N`.
    pub arity: i64,
    /// 1-based index into the request args of the ordering key.
    pub first_key_position: usize,
}

impl CommandDescriptor {
    pub fn new(name: impl Into<String>, arity: i64, first_key_position: usize) -> Self {
        Self {
            name: name.into(),
            arity,
            first_key_position,
        }
    }

    /// Whether a request carrying `arg_count` args satisfies the arity rule.
    pub fn accepts_arg_count(&self, arg_count: usize) -> bool {
        let tokens = arg_count as i64 + 1;
        if self.arity > 0 {
            tokens == self.arity
        } else {
            tokens >= -self.arity
        }
    }

    /// The smallest number of args any accepted request carries.
    fn min_arg_count(&self) -> i64 {
        self.arity.abs() - 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    InvalidKeyPosition {
        name: String,
        arity: i64,
        first_key_position: usize,
    },
    Empty,
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidKeyPosition {
                name,
                arity,
                first_key_position,
            } => write!(
                f,
                "command {name}: first key position {first_key_position} is out of range for arity {arity}"
            ),
            Self::Empty => write!(f, "no allow-listed command is supported by the store"),
        }
    }
}

impl std::error::Error for CatalogError {}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    commands: HashMap<String, CommandDescriptor>,
}

impl Catalog {
    pub fn build(
        introspected: impl IntoIterator<Item = CommandDescriptor>,
        allow_list: &[String],
    ) -> Result<Self, CatalogError> {
        let allowed = allow_list
            .iter()
            .map(|name| name.trim().to_ascii_lowercase())
            .filter(|name| !name.is_empty())
            .collect::<BTreeSet<_>>();

        let mut commands = HashMap::new();
        for mut desc in introspected {
            desc.name = desc.name.to_ascii_lowercase();
            if !allowed.contains(&desc.name) {
                continue;
            }
            validate(&desc)?;
            commands.insert(desc.name.clone(), desc);
        }

        for name in allowed.iter().filter(|n| !commands.contains_key(*n)) {
            warn!(command = %name, "allow-listed command is unknown to the store; skipping");
        }

        if commands.is_empty() {
            return Err(CatalogError::Empty);
        }
        Ok(Self { commands })
    }

    pub fn resolve(&self, name: &str) -> Option<&CommandDescriptor> {
        self.commands.get(name)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn names(&self) -> BTreeSet<&str> {
        self.commands.keys().map(String::as_str).collect()
    }
}

fn validate(desc: &CommandDescriptor) -> Result<(), CatalogError> {
    let pos = desc.first_key_position as i64;
    if desc.arity == 0 || pos < 1 || pos > desc.min_arg_count() {
        return Err(CatalogError::InvalidKeyPosition {
            name: desc.name.clone(),
            arity: desc.arity,
            first_key_position: desc.first_key_position,
        });
    }
    Ok(())
}
