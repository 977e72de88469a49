//! # Target
//!
//! Patch targets are named, not addressed. A [`TargetDescriptor`] carries the declaring type name,
//! the method name and optionally the parameter type names, and is only turned into an address when
//! a patch is applied. This lets units refer to code that isn't loaded yet when they are declared.

use std::collections::HashMap;
use std::fmt::{self, Display};

/// Deferred reference to a method
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TargetDescriptor {
    /// Full name of the declaring type, e.g. `Game.Player.Inventory`
    pub type_name: String,
    /// Name of the method on the declaring type
    pub method_name: String,
    /// Full type names of the parameters, used to pick an overload.
    /// `None` matches any overload.
    pub parameters: Option<Vec<String>>,
}
impl TargetDescriptor {
    /// Targets `method_name` on `type_name`, any overload
    pub fn new(type_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            method_name: method_name.into(),
            parameters: None,
        }
    }

    /// Restricts the target to the overload taking exactly these parameter types
    pub fn with_parameters<I, S>(mut self, parameters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parameters = Some(parameters.into_iter().map(Into::into).collect());
        self
    }
}
impl Display for TargetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.type_name, self.method_name)?;
        if let Some(parameters) = &self.parameters {
            write!(f, "({})", parameters.join(", "))?;
        }
        Ok(())
    }
}

/// Resolves [`TargetDescriptor`]s into code addresses at patch time
pub trait SymbolResolver {
    /// Returns the address of the target, or `None` if it can't be found
    fn resolve(&self, target: &TargetDescriptor) -> Option<usize>;
}

/// Map-backed resolver.
///
/// Entries registered without parameters match a descriptor of any overload.
#[derive(Default, Debug)]
pub struct SymbolTable {
    /// `(type, method)` → known overloads
    symbols: HashMap<(String, String), Vec<(Option<Vec<String>>, usize)>>,
}
impl SymbolTable {
    /// Creates an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the address of a method
    pub fn insert(&mut self, target: TargetDescriptor, address: usize) {
        let TargetDescriptor {
            type_name,
            method_name,
            parameters,
        } = target;
        let overloads = self.symbols.entry((type_name, method_name)).or_default();
        match overloads.iter_mut().find(|(p, _)| *p == parameters) {
            Some(existing) => existing.1 = address,
            None => overloads.push((parameters, address)),
        }
    }
}
impl SymbolResolver for SymbolTable {
    fn resolve(&self, target: &TargetDescriptor) -> Option<usize> {
        let overloads = self
            .symbols
            .get(&(target.type_name.clone(), target.method_name.clone()))?;
        match &target.parameters {
            // any overload will do, but prefer the unqualified entry
            None => overloads
                .iter()
                .find(|(p, _)| p.is_none())
                .or_else(|| overloads.first())
                .map(|(_, a)| *a),
            Some(wanted) => overloads
                .iter()
                .find(|(p, _)| p.as_ref() == Some(wanted))
                .map(|(_, a)| *a),
        }
    }
}
