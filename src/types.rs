/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Types as seen by the checker, and the Sendable oracle.
//!
//! The checker never inspects type structure itself: it asks a
//! `TypeOracle` a handful of yes/no questions. `TypeTable` is the
//! oracle used by the tool and the tests; a compiler embedding the
//! checker would implement the trait on top of its own type checker.

use alloc::string::String;

use crate::Type;

/// The shape of a nominal or structural type, as far as aliasing is
/// concerned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum TypeKind {
    /// Integers, booleans and other trivial builtins.
    Builtin,
    /// A class: mutation through one reference is visible through all.
    Class,
    /// An actor: always Sendable; its state is protected by isolation.
    Actor,
    Struct,
    Enum,
    Tuple,
    /// A function or closure type.
    Function,
}

impl TypeKind {
    /// Does a value of this kind have reference semantics?
    pub fn is_reference(self) -> bool {
        matches!(self, TypeKind::Class | TypeKind::Actor)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct TypeData {
    pub name: String,
    pub kind: TypeKind,
    /// Values of this type may be shared across isolation domains.
    pub sendable: bool,
    /// Values of this type cannot be copied.
    pub move_only: bool,
    /// Declared in a module compiled without strict concurrency checking.
    pub preconcurrency: bool,
}

impl TypeData {
    /// Create a copyable type. Builtins and actors are Sendable by
    /// default; everything else is not.
    pub fn new(name: &str, kind: TypeKind) -> Self {
        TypeData {
            name: String::from(name),
            kind,
            sendable: matches!(kind, TypeKind::Builtin | TypeKind::Actor),
            move_only: false,
            preconcurrency: false,
        }
    }

    pub fn sendable(mut self, sendable: bool) -> Self {
        self.sendable = sendable;
        self
    }

    pub fn move_only(mut self) -> Self {
        self.move_only = true;
        self
    }

    pub fn preconcurrency(mut self) -> Self {
        self.preconcurrency = true;
        self
    }
}

define_arena!(TypeTable, Type, TypeData);

impl TypeTable {
    /// Add a type and return its id.
    pub fn add(&mut self, data: TypeData) -> Type {
        self.push(data)
    }

    /// Find a type by name.
    pub fn lookup(&self, name: &str) -> Option<Type> {
        self.keys().find(|&ty| self[ty].name == name)
    }
}

/// Black-box questions the checker asks about types.
pub trait TypeOracle {
    /// May values of `ty` be shared across isolation domains without
    /// region tracking?
    fn is_sendable(&self, ty: Type) -> bool;

    /// Is `ty` a non-copyable type, subject to consume-once checking?
    fn is_move_only(&self, _ty: Type) -> bool {
        false
    }

    /// Does `ty` have reference semantics?
    fn is_reference(&self, ty: Type) -> bool;

    /// Was `ty` declared in a module compiled without strict
    /// concurrency checking?
    fn is_preconcurrency(&self, _ty: Type) -> bool {
        false
    }

    /// A printable name for `ty`.
    fn type_name(&self, ty: Type) -> &str;
}

impl TypeOracle for TypeTable {
    fn is_sendable(&self, ty: Type) -> bool {
        self[ty].sendable
    }

    fn is_move_only(&self, ty: Type) -> bool {
        self[ty].move_only
    }

    fn is_reference(&self, ty: Type) -> bool {
        self[ty].kind.is_reference()
    }

    fn is_preconcurrency(&self, ty: Type) -> bool {
        self[ty].preconcurrency
    }

    fn type_name(&self, ty: Type) -> &str {
        &self[ty].name
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_default_sendability() {
        let mut types = TypeTable::new();
        let int = types.add(TypeData::new("Int", TypeKind::Builtin));
        let klass = types.add(TypeData::new("Klass", TypeKind::Class));
        let main = types.add(TypeData::new("MainActor", TypeKind::Actor));
        let token = types.add(TypeData::new("Token", TypeKind::Struct).sendable(true).move_only());

        assert!(types.is_sendable(int));
        assert!(!types.is_sendable(klass));
        assert!(types.is_sendable(main));
        assert!(types.is_reference(klass));
        assert!(!types.is_reference(token));
        assert!(types.is_move_only(token));
        assert_eq!(types.lookup("Klass"), Some(klass));
        assert_eq!(types.type_name(main), "MainActor");
    }
}
