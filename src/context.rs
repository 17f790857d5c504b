use elsa::FrozenIndexSet;
use std::convert::TryInto;
use std::hash::Hash;

/// Context object with global resources for DXIL-T.
///
/// Those resources currently are only interners, for anything without an
/// identity, and which can be deduplicated (types, constants and strings).
///
/// A `Context` is shared (through `Rc`) between a `Program` and all of its
/// copies, interning never removes anything, so sharing is always sound.
pub struct Context {
    interners: Interners,
}

/// Dispatch helper, to allow implementing interning logic on
/// the type passed to `cx.intern(...)`.
pub trait InternInCx {
    type Interned;

    fn intern_in_cx(self, cx: &Context) -> Self::Interned;
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    pub fn new() -> Self {
        Context {
            interners: Interners::default(),
        }
    }

    pub fn intern<T: InternInCx>(&self, x: T) -> T::Interned {
        x.intern_in_cx(self)
    }

    /// Look up an already interned definition, without interning it.
    pub fn find_type(&self, def: &crate::il::TypeDef) -> Option<Type> {
        self.interners
            .Type
            .0
            .get_full(def)
            .map(|(i, _)| Type(i as u32))
    }
}

struct Interner<T: ?Sized>(FrozenIndexSet<Box<T>>);

impl<T: ?Sized + Eq + Hash> Default for Interner<T> {
    fn default() -> Self {
        Self(FrozenIndexSet::new())
    }
}

impl<T: ?Sized + Eq + Hash> Interner<T> {
    #[track_caller]
    fn intern(&self, value: impl AsRef<T> + Into<Box<T>>) -> u32 {
        if let Some((i, _)) = self.0.get_full(value.as_ref()) {
            return i as u32;
        }
        let (i, _) = self.0.insert_full(value.into());
        i.try_into().expect("interner overflowed u32")
    }
}

macro_rules! interners {
    (
        needs_as_ref { $($needs_as_ref_ty:ty),* $(,)? }
        $($name:ident => $ty:ty),+ $(,)?
    ) => {
        $(impl AsRef<Self> for $needs_as_ref_ty {
            fn as_ref(&self) -> &Self {
                self
            }
        })*

        #[allow(non_snake_case)]
        #[derive(Default)]
        struct Interners {
            $($name: Interner<$ty>),*
        }

        $(
            // NOTE(eddyb) never derive `PartialOrd, Ord` for these types, as
            // observing the interning order shouldn't be allowed.
            #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
            pub struct $name(u32);

            impl std::ops::Index<$name> for Context {
                type Output = $ty;

                fn index(&self, interned: $name) -> &Self::Output {
                    &self.interners.$name.0[interned.0 as usize]
                }
            }
        )*
    };
}

interners! {
    needs_as_ref {
        crate::il::TypeDef,
        crate::il::ConstDef,
    }

    InternedStr => str,
    Type => crate::il::TypeDef,
    Const => crate::il::ConstDef,
}

impl InternInCx for &'_ str {
    type Interned = InternedStr;

    fn intern_in_cx(self, cx: &Context) -> InternedStr {
        InternedStr(cx.interners.InternedStr.intern(self))
    }
}

impl InternInCx for String {
    type Interned = InternedStr;

    fn intern_in_cx(self, cx: &Context) -> InternedStr {
        InternedStr(cx.interners.InternedStr.intern(self))
    }
}

// FIXME(eddyb) automate the common form of this away.
impl InternInCx for crate::il::TypeDef {
    type Interned = Type;

    fn intern_in_cx(self, cx: &Context) -> Self::Interned {
        Type(cx.interners.Type.intern(self))
    }
}

// FIXME(eddyb) automate the common form of this away.
impl InternInCx for crate::il::ConstDef {
    type Interned = Const;

    fn intern_in_cx(self, cx: &Context) -> Self::Interned {
        Const(cx.interners.Const.intern(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::{ConstDef, ConstKind, TypeDef};

    #[test]
    fn interning_is_idempotent() {
        let cx = Context::new();

        let i32_a = cx.intern(TypeDef::Int {
            bit_width: 32,
            signed: true,
        });
        let i32_b = cx.intern(TypeDef::Int {
            bit_width: 32,
            signed: true,
        });
        let u32_ty = cx.intern(TypeDef::Int {
            bit_width: 32,
            signed: false,
        });
        assert_eq!(i32_a, i32_b);
        assert_ne!(i32_a, u32_ty);

        let vec_a = cx.intern(TypeDef::Vector {
            contained: i32_a,
            dim: 4,
        });
        let vec_b = cx.intern(TypeDef::Vector {
            contained: i32_b,
            dim: 4,
        });
        assert_eq!(vec_a, vec_b);
        assert_eq!(cx.find_type(&TypeDef::Vector { contained: i32_a, dim: 4 }), Some(vec_a));
        assert_eq!(cx.find_type(&TypeDef::Vector { contained: i32_a, dim: 3 }), None);

        let c0 = cx.intern(ConstDef {
            ty: i32_a,
            kind: ConstKind::Int(7),
        });
        let c1 = cx.intern(ConstDef {
            ty: i32_b,
            kind: ConstKind::Int(7),
        });
        let c2 = cx.intern(ConstDef {
            ty: u32_ty,
            kind: ConstKind::Int(7),
        });
        assert_eq!(c0, c1);
        assert_ne!(c0, c2);

        assert_eq!(cx.intern("dx.resources"), cx.intern(String::from("dx.resources")));
        assert_eq!(&cx[cx.intern("dx.op")], "dx.op");
    }
}
