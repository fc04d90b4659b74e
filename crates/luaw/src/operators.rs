//! Operator binding for native types
//!
//! [`detected_operators!`](crate::detected_operators) inspects a type at
//! compile time and yields an [`Operator`] for each of `+ - * /`, unary `-`,
//! `==`, `<` and `<=` that the type implements. Detection uses method
//! resolution on a probe value: an inherent-looking trait method applies
//! when the operator trait is implemented, and a fallback reached through
//! auto-ref applies otherwise.
//!
//! Arithmetic operators work on clones of both operands and push the result
//! as a new object of the same type.

use std::marker::PhantomData;
use std::os::raw::c_int;

use crate::callback::Callback;
use crate::class::MetaMethod;
use crate::convert::ToLua;
use crate::state::Lua;
use crate::userdata::{NativePtr, UserType};

/// A metamethod binding for `T`.
pub struct Operator<T> {
    event: MetaMethod,
    callback: Callback,
    _marker: PhantomData<fn() -> T>,
}

impl<T: UserType> Operator<T> {
    /// Binary operator reading both operands as `T`.
    pub fn binary<R, F>(event: MetaMethod, op: F) -> Self
    where
        F: Fn(&T, &T) -> R + 'static,
        R: ToLua,
    {
        Operator {
            event,
            callback: Callback::new(move |lua: &Lua| {
                let lhs = lua.read_argument::<NativePtr<T>>(1)?;
                let rhs = lua.read_argument::<NativePtr<T>>(2)?;
                let _borrows = (lhs.borrow()?, rhs.borrow()?);
                let result = unsafe { op(lhs.as_ref(), rhs.as_ref()) };
                result.push(lua)?;
                Ok(1 as c_int)
            }),
            _marker: PhantomData,
        }
    }

    /// Unary operator on the first operand.
    pub fn unary<R, F>(event: MetaMethod, op: F) -> Self
    where
        F: Fn(&T) -> R + 'static,
        R: ToLua,
    {
        Operator {
            event,
            callback: Callback::new(move |lua: &Lua| {
                let operand = lua.read_argument::<NativePtr<T>>(1)?;
                let _borrow = operand.borrow()?;
                let result = unsafe { op(operand.as_ref()) };
                result.push(lua)?;
                Ok(1 as c_int)
            }),
            _marker: PhantomData,
        }
    }

    /// Event this operator is bound to.
    pub fn event(&self) -> MetaMethod {
        self.event
    }

    pub(crate) fn into_parts(self) -> (MetaMethod, Callback) {
        (self.event, self.callback)
    }
}

/// Support items for [`detected_operators!`](crate::detected_operators).
#[doc(hidden)]
pub mod detect {
    use std::marker::PhantomData;
    use std::ops::{Add, Div, Mul, Neg, Sub};

    use super::Operator;
    use crate::class::MetaMethod;
    use crate::userdata::UserType;

    /// Probe value; detection methods are called on `&Detect<T>`.
    pub struct Detect<T>(PhantomData<fn() -> T>);

    impl<T> Detect<T> {
        #[allow(clippy::new_without_default)]
        pub fn new() -> Self {
            Detect(PhantomData)
        }
    }

    macro_rules! arithmetic {
        ($supported:ident, $fallback:ident, $method:ident, $op_trait:ident, $event:ident, $op:tt) => {
            pub trait $supported {
                type Target;
                fn $method(&self) -> Option<Operator<Self::Target>>;
            }

            impl<T> $supported for Detect<T>
            where
                T: UserType + Clone + $op_trait<Output = T>,
            {
                type Target = T;
                fn $method(&self) -> Option<Operator<T>> {
                    Some(Operator::binary(MetaMethod::$event, |a: &T, b: &T| a.clone() $op b.clone()))
                }
            }

            pub trait $fallback {
                type Target;
                fn $method(&self) -> Option<Operator<Self::Target>> {
                    None
                }
            }

            impl<T> $fallback for &Detect<T> {
                type Target = T;
            }
        };
    }

    arithmetic!(SupportsAdd, LacksAdd, detect_add, Add, Add, +);
    arithmetic!(SupportsSub, LacksSub, detect_sub, Sub, Sub, -);
    arithmetic!(SupportsMul, LacksMul, detect_mul, Mul, Mul, *);
    arithmetic!(SupportsDiv, LacksDiv, detect_div, Div, Div, /);

    macro_rules! detection {
        ($supported:ident, $fallback:ident, $method:ident, [$($bound:tt)*], $body:expr) => {
            pub trait $supported {
                type Target;
                fn $method(&self) -> Option<Operator<Self::Target>>;
            }

            impl<T> $supported for Detect<T>
            where
                T: UserType + $($bound)*,
            {
                type Target = T;
                fn $method(&self) -> Option<Operator<T>> {
                    Some($body)
                }
            }

            pub trait $fallback {
                type Target;
                fn $method(&self) -> Option<Operator<Self::Target>> {
                    None
                }
            }

            impl<T> $fallback for &Detect<T> {
                type Target = T;
            }
        };
    }

    detection!(
        SupportsNeg,
        LacksNeg,
        detect_neg,
        [Clone + Neg<Output = T>],
        Operator::unary(MetaMethod::Unm, |a: &T| -a.clone())
    );
    detection!(
        SupportsEq,
        LacksEq,
        detect_eq,
        [PartialEq],
        Operator::binary(MetaMethod::Eq, |a: &T, b: &T| a == b)
    );
    detection!(
        SupportsLt,
        LacksLt,
        detect_lt,
        [PartialOrd],
        Operator::binary(MetaMethod::Lt, |a: &T, b: &T| a < b)
    );
    detection!(
        SupportsLe,
        LacksLe,
        detect_le,
        [PartialOrd],
        Operator::binary(MetaMethod::Le, |a: &T, b: &T| a <= b)
    );
}

/// Operators implemented by a native type, for
/// [`ClassBuilder::add_detected_operators`](crate::ClassBuilder::add_detected_operators).
///
/// ```ignore
/// lua.register_type::<Vec2>()?
///     .add_detected_operators(luaw::detected_operators!(Vec2));
/// ```
#[macro_export]
macro_rules! detected_operators {
    ($ty:ty) => {{
        #[allow(unused_imports)]
        use $crate::operators::detect::*;
        let probe = $crate::operators::detect::Detect::<$ty>::new();
        let detected: ::std::vec::Vec<$crate::Operator<$ty>> = [
            (&probe).detect_add(),
            (&probe).detect_sub(),
            (&probe).detect_mul(),
            (&probe).detect_div(),
            (&probe).detect_neg(),
            (&probe).detect_eq(),
            (&probe).detect_lt(),
            (&probe).detect_le(),
        ]
        .into_iter()
        .flatten()
        .collect();
        detected
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ops::Add;

    #[derive(Clone, Debug, PartialEq, PartialOrd, crate::UserType)]
    struct Money(i64);

    impl Add for Money {
        type Output = Money;
        fn add(self, other: Money) -> Money {
            Money(self.0 + other.0)
        }
    }

    #[derive(Clone, crate::UserType)]
    struct Opaque;

    fn events<T>(operators: &[Operator<T>]) -> Vec<MetaMethod> {
        operators.iter().map(|op| op.event).collect()
    }

    #[test]
    fn test_detects_implemented_operators() {
        let found = crate::detected_operators!(Money);
        assert_eq!(
            events(&found),
            vec![MetaMethod::Add, MetaMethod::Eq, MetaMethod::Lt, MetaMethod::Le]
        );
    }

    #[test]
    fn test_detects_nothing_for_plain_types() {
        assert!(crate::detected_operators!(Opaque).is_empty());
    }

    #[test]
    fn test_bound_operators_run() {
        let lua = Lua::new();
        lua.register_type::<Money>()
            .unwrap()
            .add_constructor(|cents: i64| Money(cents))
            .add_detected_operators(crate::detected_operators!(Money))
            .finish()
            .unwrap();

        lua.exec("a = Money.new(250) b = Money.new(100) c = a + b").unwrap();
        assert_eq!(lua.get_global::<Money>("c").unwrap(), Money(350));
        assert!(lua.eval::<bool>("return b < a and b <= b and a == Money.new(250)").unwrap());
        assert!(lua.exec("d = a * b").is_err());
    }
}
