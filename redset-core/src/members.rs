use bytes::Bytes;
use redset_store::Member;

/// Values which can be flattened into a batch of members.
///
/// Implemented for single values, arrays, vectors, slices and tuples of any
/// of these, so mixed inputs collapse into a single batch call.
pub trait IntoMembers {
    /// Appends every member this value holds to `batch`.
    fn extend_members(self, batch: &mut Vec<Member>);

    fn into_members(self) -> Vec<Member>
    where
        Self: Sized,
    {
        let mut batch = Vec::new();
        self.extend_members(&mut batch);
        batch
    }
}

macro_rules! single_member {
    ($($ty:ty),* $(,)?) => {
        $(
            impl IntoMembers for $ty {
                fn extend_members(self, batch: &mut Vec<Member>) {
                    batch.push(Member::from(self));
                }
            }
        )*
    };
}

single_member!(Member, &Member, &str, String, &String, Bytes);

impl<T: IntoMembers, const N: usize> IntoMembers for [T; N] {
    fn extend_members(self, batch: &mut Vec<Member>) {
        for value in self {
            value.extend_members(batch);
        }
    }
}

impl<T: IntoMembers> IntoMembers for Vec<T> {
    fn extend_members(self, batch: &mut Vec<Member>) {
        for value in self {
            value.extend_members(batch);
        }
    }
}

impl<T: IntoMembers + Clone> IntoMembers for &[T] {
    fn extend_members(self, batch: &mut Vec<Member>) {
        for value in self {
            value.clone().extend_members(batch);
        }
    }
}

macro_rules! tuple_members {
    ($($name:ident),+) => {
        impl<$($name: IntoMembers),+> IntoMembers for ($($name,)+) {
            #[allow(non_snake_case)]
            fn extend_members(self, batch: &mut Vec<Member>) {
                let ($($name,)+) = self;
                $($name.extend_members(batch);)+
            }
        }
    };
}

tuple_members!(A);
tuple_members!(A, B);
tuple_members!(A, B, C);
tuple_members!(A, B, C, D);
tuple_members!(A, B, C, D, E);
tuple_members!(A, B, C, D, E, F);
tuple_members!(A, B, C, D, E, F, G);
tuple_members!(A, B, C, D, E, F, G, H);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// A batch of members built up from values of different shapes.
///
/// Usually created with the [members!](crate::members) macro.
pub struct MemberBatch(Vec<Member>);

impl MemberBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flattens the value into the batch.
    pub fn push(&mut self, value: impl IntoMembers) {
        value.extend_members(&mut self.0);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl IntoMembers for MemberBatch {
    fn extend_members(self, batch: &mut Vec<Member>) {
        batch.extend(self.0);
    }
}

impl From<MemberBatch> for Vec<Member> {
    fn from(batch: MemberBatch) -> Self {
        batch.0
    }
}

#[macro_export]
/// Builds a [MemberBatch] out of a mix of single values and collections.
///
/// ```
/// use redset_core::{members, IntoMembers};
///
/// let batch = members!(["a", "b", "c"], "d", ["e", "f"], "g");
/// assert_eq!(batch.into_members().len(), 7);
/// ```
macro_rules! members {
    ($($value:expr),* $(,)?) => {{
        #[allow(unused_mut)]
        let mut batch = $crate::MemberBatch::new();
        $(batch.push($value);)*
        batch
    }};
}
