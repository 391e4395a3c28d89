/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Isolation domains and the rules for crossing between them.

use core::fmt;

use crate::ir::Function;
use crate::types::TypeOracle;
use crate::{Type, Value};

/// An execution context with its own exclusive-access guarantee.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum IsolationDomain {
    #[default]
    Nonisolated,
    /// Owned by the current task.
    Task,
    /// Isolated to the actor instance held in the given value.
    ActorInstance(Value),
    /// Isolated to a global actor, named by its type.
    GlobalActor(Type),
}

impl IsolationDomain {
    /// Do code running in `self` and code running in `other` share an
    /// executor? Nonisolated code runs on the task that calls it, so it
    /// shares the task's domain.
    pub fn is_same_domain(self, other: IsolationDomain) -> bool {
        use IsolationDomain::*;
        match (self, other) {
            (Nonisolated | Task, Nonisolated | Task) => true,
            (a, b) => a == b,
        }
    }

    pub fn is_actor_isolated(self) -> bool {
        matches!(
            self,
            IsolationDomain::ActorInstance(_) | IsolationDomain::GlobalActor(_)
        )
    }

    fn rank(self) -> u8 {
        match self {
            IsolationDomain::Nonisolated => 0,
            IsolationDomain::Task => 1,
            IsolationDomain::GlobalActor(_) => 2,
            IsolationDomain::ActorInstance(_) => 3,
        }
    }

    /// The domain of a region formed by joining regions in `self` and
    /// `other`: the more restrictive one wins, and on a tie the left
    /// operand is kept.
    pub fn merge(self, other: IsolationDomain) -> IsolationDomain {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }

    /// The domain parameters of a function in `self` belong to.
    pub fn parameter_domain(self) -> IsolationDomain {
        match self {
            IsolationDomain::Nonisolated => IsolationDomain::Task,
            other => other,
        }
    }

    /// Human readable description for diagnostics.
    pub fn describe<'a, O: TypeOracle + ?Sized>(
        self,
        func: &'a Function,
        oracle: &'a O,
    ) -> DescribeDomain<'a, O> {
        DescribeDomain {
            domain: self,
            func,
            oracle,
        }
    }
}

pub struct DescribeDomain<'a, O: ?Sized> {
    domain: IsolationDomain,
    func: &'a Function,
    oracle: &'a O,
}

impl<'a, O: TypeOracle + ?Sized> fmt::Display for DescribeDomain<'a, O> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.domain {
            IsolationDomain::Nonisolated => write!(f, "nonisolated"),
            IsolationDomain::Task => write!(f, "task-isolated"),
            IsolationDomain::ActorInstance(actor) => match self.func.value_name(actor) {
                Some(name) => write!(f, "actor-isolated to '{}'", name),
                None => write!(f, "actor-isolated to {}", actor),
            },
            IsolationDomain::GlobalActor(ty) => {
                write!(f, "global actor '{}'-isolated", self.oracle.type_name(ty))
            }
        }
    }
}

/// The caller and callee domains of a call that changes isolation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IsolationCrossing {
    pub caller: IsolationDomain,
    pub callee: IsolationDomain,
}

impl IsolationCrossing {
    /// Classify a call from `caller` to a callee in `callee` (or in the
    /// caller's domain if `None`). Returns `None` for a same-domain call.
    pub fn classify(
        caller: IsolationDomain,
        callee: Option<IsolationDomain>,
    ) -> Option<IsolationCrossing> {
        let callee = callee?;
        if caller.is_same_domain(callee) {
            None
        } else {
            Some(IsolationCrossing { caller, callee })
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::FunctionBuilder;
    use crate::ir::InstKind;
    use crate::types::{TypeData, TypeKind, TypeTable};
    use alloc::format;

    #[test]
    fn test_same_domain() {
        let main = IsolationDomain::GlobalActor(Type::new(0));
        let other = IsolationDomain::GlobalActor(Type::new(1));
        let actor = IsolationDomain::ActorInstance(Value::new(0));
        assert!(IsolationDomain::Nonisolated.is_same_domain(IsolationDomain::Task));
        assert!(main.is_same_domain(main));
        assert!(!main.is_same_domain(other));
        assert!(!actor.is_same_domain(IsolationDomain::Task));
        assert!(!IsolationDomain::Nonisolated.is_same_domain(main));
    }

    #[test]
    fn test_crossing() {
        let main = IsolationDomain::GlobalActor(Type::new(0));
        assert_eq!(IsolationCrossing::classify(main, None), None);
        assert_eq!(IsolationCrossing::classify(main, Some(main)), None);
        assert_eq!(
            IsolationCrossing::classify(IsolationDomain::Task, Some(main)),
            Some(IsolationCrossing {
                caller: IsolationDomain::Task,
                callee: main,
            })
        );
    }

    #[test]
    fn test_merge_and_describe() {
        let mut types = TypeTable::new();
        let main_ty = types.add(TypeData::new("MainActor", TypeKind::Actor));
        let main = IsolationDomain::GlobalActor(main_ty);
        assert_eq!(IsolationDomain::Task.merge(main), main);
        assert_eq!(main.merge(IsolationDomain::Nonisolated), main);

        let mut b = FunctionBuilder::new("f", IsolationDomain::Nonisolated);
        let entry = b.entry_block();
        b.add_inst(entry, InstKind::Return, &[], &[]);
        let f = b.finish().unwrap();
        assert_eq!(
            format!("{}", main.describe(&f, &types)),
            "global actor 'MainActor'-isolated"
        );
        assert_eq!(
            format!("{}", IsolationDomain::Task.describe(&f, &types)),
            "task-isolated"
        );
    }
}
