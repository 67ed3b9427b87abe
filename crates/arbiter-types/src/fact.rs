use crate::FactValue;
use serde::{Serialize, Serializer};
use std::any::{Any, TypeId};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Static kind of a fact field, used by the validator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FieldKind {
    /// Whole numbers
    Integer,
    /// Floating point numbers
    Float,
    /// Text
    String,
    /// true/false
    Boolean,
    /// UTC timestamps
    Date,
    /// Arrays or objects
    Composite,
}

impl FieldKind {
    /// Whether arithmetic over this field is meaningful
    #[must_use]
    pub const fn is_numeric(self) -> bool {
        matches!(self, Self::Integer | Self::Float)
    }
}

/// Description of one field a fact type exposes to expression conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FieldSpec {
    /// Field name as referenced by expressions
    pub name: &'static str,
    /// Static kind of the field
    pub kind: FieldKind,
    /// Whether the field may be absent (`FactValue::Null`)
    pub nullable: bool,
    /// Whether conditions may read the field
    pub readable: bool,
}

impl FieldSpec {
    /// A readable, non-nullable field
    #[must_use]
    pub const fn new(name: &'static str, kind: FieldKind) -> Self {
        Self { name, kind, nullable: false, readable: true }
    }

    /// Mark the field as possibly absent
    #[must_use]
    pub const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Mark the field as hidden from conditions
    #[must_use]
    pub const fn write_only(mut self) -> Self {
        self.readable = false;
        self
    }
}

/// Application data evaluated against rules.
///
/// Any `Clone + PartialEq + Debug + Send + Sync + 'static` type can be a fact. Implementing
/// [`Fact::schema`] and [`Fact::field`] opts the type into expression conditions and static
/// validation; the defaults expose no fields.
pub trait Fact: Any + Clone + PartialEq + fmt::Debug + Send + Sync {
    /// Readable name for logs, errors and reports
    fn type_name() -> &'static str
    where
        Self: Sized,
    {
        short_type_name::<Self>()
    }

    /// Fields visible to expression conditions
    fn schema() -> &'static [FieldSpec]
    where
        Self: Sized,
    {
        &[]
    }

    /// Read a field by name. `None` means the fact type has no such field.
    fn field(&self, name: &str) -> Option<FactValue> {
        let _ = name;
        None
    }
}

/// Last path segment of `std::any::type_name`, keeping generic arguments intact
#[must_use]
pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let head = full.split('<').next().unwrap_or(full);
    match head.rfind("::") {
        Some(idx) => &full[idx + 2..],
        None => full,
    }
}

/// Runtime identifier of a fact type.
///
/// Equality and hashing use the `TypeId`; ordering uses the readable name first so that
/// execution plans are stable across runs.
#[derive(Clone, Copy)]
pub struct FactType {
    id: TypeId,
    name: &'static str,
}

impl FactType {
    /// Identifier for `T`
    #[must_use]
    pub fn of<T: Fact>() -> Self {
        Self { id: TypeId::of::<T>(), name: T::type_name() }
    }

    /// Readable name
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Underlying `TypeId`
    #[must_use]
    pub const fn type_id(&self) -> TypeId {
        self.id
    }

    /// Whether this identifies `T`
    #[must_use]
    pub fn is<T: Fact>(&self) -> bool {
        self.id == TypeId::of::<T>()
    }
}

impl PartialEq for FactType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for FactType {}

impl Hash for FactType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for FactType {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FactType {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name.cmp(other.name).then_with(|| self.id.cmp(&other.id))
    }
}

impl fmt::Debug for FactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FactType({})", self.name)
    }
}

impl fmt::Display for FactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl Serialize for FactType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name)
    }
}
