use std::fmt;

pub type ObjectId = u32;
pub type ThreadId = ObjectId;
pub type TypeId = u32;
pub type MethodId = u32;
pub type FieldId = u32;
pub type ModuleId = u32;
pub type DomainId = u32;
pub type AssemblyId = u32;
pub type FrameId = u32;

/// Element-type tags selecting the payload shape of a [`Value`].
pub mod tag {
    pub const VOID: u8 = 0x01;
    pub const BOOLEAN: u8 = 0x02;
    pub const CHAR: u8 = 0x03;
    pub const I1: u8 = 0x04;
    pub const U1: u8 = 0x05;
    pub const I2: u8 = 0x06;
    pub const U2: u8 = 0x07;
    pub const I4: u8 = 0x08;
    pub const U4: u8 = 0x09;
    pub const I8: u8 = 0x0a;
    pub const U8: u8 = 0x0b;
    pub const R4: u8 = 0x0c;
    pub const R8: u8 = 0x0d;
    pub const STRING: u8 = 0x0e;
    pub const PTR: u8 = 0x0f;
    pub const VALUETYPE: u8 = 0x11;
    pub const CLASS: u8 = 0x12;
    pub const ARRAY: u8 = 0x14;
    pub const I: u8 = 0x18;
    pub const U: u8 = 0x19;
    pub const OBJECT: u8 = 0x1c;
    pub const SZARRAY: u8 = 0x1d;

    pub const NULL: u8 = 0xf0;
    pub const TYPE: u8 = 0xf1;
    pub const PARENT_VTYPE: u8 = 0xf2;
    pub const FIXED_ARRAY: u8 = 0xf3;
}

/// The element tags that carry an object reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectTag {
    String,
    Class,
    Array,
    Object,
    SzArray,
}

impl ObjectTag {
    pub const ALL: [ObjectTag; 5] = [
        ObjectTag::String,
        ObjectTag::Class,
        ObjectTag::Array,
        ObjectTag::Object,
        ObjectTag::SzArray,
    ];

    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            tag::STRING => ObjectTag::String,
            tag::CLASS => ObjectTag::Class,
            tag::ARRAY => ObjectTag::Array,
            tag::OBJECT => ObjectTag::Object,
            tag::SZARRAY => ObjectTag::SzArray,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        match self {
            ObjectTag::String => tag::STRING,
            ObjectTag::Class => tag::CLASS,
            ObjectTag::Array => tag::ARRAY,
            ObjectTag::Object => tag::OBJECT,
            ObjectTag::SzArray => tag::SZARRAY,
        }
    }
}

/// A `major.minor` protocol version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionInfo {
    pub major: u32,
    pub minor: u32,
}

impl VersionInfo {
    /// The version this client implements and announces during the handshake.
    pub const LOCAL: VersionInfo = VersionInfo::new(2, 58);

    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    pub fn at_least(self, major: u32, minor: u32) -> bool {
        self >= VersionInfo::new(major, minor)
    }
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self::LOCAL
    }
}

impl fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Reply to `VM.VERSION`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmVersion {
    pub description: String,
    pub version: VersionInfo,
}

/// Protocol features added after the baseline; each is gated on the
/// negotiated version before any packet is sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Feature {
    SetProtocolVersion,
    MethodSourceTable,
    StepFilter,
    MethodLineColumns,
    AbortInvoke,
    ExceptionSubclassFilter,
    VmDeathExitCode,
    MethodEndLineColumns,
    ObjectInfo,
    InvokeMethods,
    CrashEvents,
    ErrorMessages,
}

impl Feature {
    pub fn required_version(self) -> VersionInfo {
        let minor = match self {
            Feature::SetProtocolVersion => 8,
            Feature::MethodSourceTable => 13,
            Feature::StepFilter => 16,
            Feature::MethodLineColumns => 19,
            Feature::AbortInvoke => 22,
            Feature::ExceptionSubclassFilter => 25,
            Feature::VmDeathExitCode => 27,
            Feature::MethodEndLineColumns => 32,
            Feature::ObjectInfo => 38,
            Feature::InvokeMethods => 47,
            Feature::CrashEvents => 54,
            Feature::ErrorMessages => 56,
        };
        VersionInfo::new(2, minor)
    }

    pub fn name(self) -> &'static str {
        match self {
            Feature::SetProtocolVersion => "VM.SET_PROTOCOL_VERSION",
            Feature::MethodSourceTable => "method source-file tables",
            Feature::StepFilter => "step filter flags",
            Feature::MethodLineColumns => "method line-table columns",
            Feature::AbortInvoke => "VM.ABORT_INVOKE",
            Feature::ExceptionSubclassFilter => "exception subclass filtering",
            Feature::VmDeathExitCode => "VM death exit codes",
            Feature::MethodEndLineColumns => "method line-table end positions",
            Feature::ObjectInfo => "OBJECT_REF.GET_INFO",
            Feature::InvokeMethods => "VM.INVOKE_METHODS",
            Feature::CrashEvents => "crash events",
            Feature::ErrorMessages => "reply error messages",
        }
    }

    pub fn is_available(self, negotiated: VersionInfo) -> bool {
        negotiated >= self.required_version()
    }
}

/// A tagged value as carried on the wire.
///
/// Equality compares floats by bit pattern, so a decoded NaN equals the value
/// it was encoded from and `0.0 != -0.0`.
#[derive(Clone, Debug)]
pub enum Value {
    Void,
    Boolean(bool),
    Char(u16),
    I1(i8),
    U1(u8),
    I2(i16),
    U2(u16),
    I4(i32),
    U4(u32),
    I8(i64),
    U8(u64),
    R4(f32),
    R8(f64),
    IntPtr(i64),
    UIntPtr(u64),
    /// Unmanaged pointer; the raw address.
    Pointer(u64),
    /// Object reference with the element tag the peer reported for it.
    Object { tag: ObjectTag, id: ObjectId },
    ValueType(ValueTypeValue),
    /// A bare type reference.
    Type(TypeId),
    /// Back-reference to an enclosing valuetype being decoded by the peer.
    ParentValueType { index: i32 },
    Null,
    FixedArray(FixedArray),
}

impl Value {
    pub fn object(id: ObjectId) -> Self {
        Value::Object {
            tag: ObjectTag::Object,
            id,
        }
    }

    pub fn string(id: ObjectId) -> Self {
        Value::Object {
            tag: ObjectTag::String,
            id,
        }
    }

    pub fn object_id(&self) -> Option<ObjectId> {
        match self {
            Value::Object { id, .. } => Some(*id),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn element_tag(&self) -> u8 {
        match self {
            Value::Void => tag::VOID,
            Value::Boolean(_) => tag::BOOLEAN,
            Value::Char(_) => tag::CHAR,
            Value::I1(_) => tag::I1,
            Value::U1(_) => tag::U1,
            Value::I2(_) => tag::I2,
            Value::U2(_) => tag::U2,
            Value::I4(_) => tag::I4,
            Value::U4(_) => tag::U4,
            Value::I8(_) => tag::I8,
            Value::U8(_) => tag::U8,
            Value::R4(_) => tag::R4,
            Value::R8(_) => tag::R8,
            Value::IntPtr(_) => tag::I,
            Value::UIntPtr(_) => tag::U,
            Value::Pointer(_) => tag::PTR,
            Value::Object { tag, .. } => tag.as_u8(),
            Value::ValueType(_) => tag::VALUETYPE,
            Value::Type(_) => tag::TYPE,
            Value::ParentValueType { .. } => tag::PARENT_VTYPE,
            Value::Null => tag::NULL,
            Value::FixedArray(_) => tag::FIXED_ARRAY,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ValueTypeValue {
    pub is_enum: bool,
    pub type_id: TypeId,
    pub fields: Vec<Value>,
}

/// Fixed-size inline array of one scalar kind.
///
/// Float elements compare by bit pattern, as in [`Value`].
#[derive(Clone, Debug)]
pub enum FixedArray {
    Boolean(Vec<bool>),
    Char(Vec<u16>),
    I1(Vec<i8>),
    U1(Vec<u8>),
    I2(Vec<i16>),
    U2(Vec<u16>),
    I4(Vec<i32>),
    U4(Vec<u32>),
    I8(Vec<i64>),
    U8(Vec<u64>),
    R4(Vec<f32>),
    R8(Vec<f64>),
}

impl FixedArray {
    pub fn element_tag(&self) -> u8 {
        match self {
            FixedArray::Boolean(_) => tag::BOOLEAN,
            FixedArray::Char(_) => tag::CHAR,
            FixedArray::I1(_) => tag::I1,
            FixedArray::U1(_) => tag::U1,
            FixedArray::I2(_) => tag::I2,
            FixedArray::U2(_) => tag::U2,
            FixedArray::I4(_) => tag::I4,
            FixedArray::U4(_) => tag::U4,
            FixedArray::I8(_) => tag::I8,
            FixedArray::U8(_) => tag::U8,
            FixedArray::R4(_) => tag::R4,
            FixedArray::R8(_) => tag::R8,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            FixedArray::Boolean(v) => v.len(),
            FixedArray::Char(v) => v.len(),
            FixedArray::I1(v) => v.len(),
            FixedArray::U1(v) => v.len(),
            FixedArray::I2(v) => v.len(),
            FixedArray::U2(v) => v.len(),
            FixedArray::I4(v) => v.len(),
            FixedArray::U4(v) => v.len(),
            FixedArray::I8(v) => v.len(),
            FixedArray::U8(v) => v.len(),
            FixedArray::R4(v) => v.len(),
            FixedArray::R8(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        use Value::*;
        match (self, other) {
            (Void, Void) | (Null, Null) => true,
            (Boolean(a), Boolean(b)) => a == b,
            (Char(a), Char(b)) => a == b,
            (I1(a), I1(b)) => a == b,
            (U1(a), U1(b)) => a == b,
            (I2(a), I2(b)) => a == b,
            (U2(a), U2(b)) => a == b,
            (I4(a), I4(b)) => a == b,
            (U4(a), U4(b)) => a == b,
            (I8(a), I8(b)) => a == b,
            (U8(a), U8(b)) => a == b,
            (R4(a), R4(b)) => a.to_bits() == b.to_bits(),
            (R8(a), R8(b)) => a.to_bits() == b.to_bits(),
            (IntPtr(a), IntPtr(b)) => a == b,
            (UIntPtr(a), UIntPtr(b)) => a == b,
            (Pointer(a), Pointer(b)) => a == b,
            (Object { tag: ta, id: ia }, Object { tag: tb, id: ib }) => ta == tb && ia == ib,
            (ValueType(a), ValueType(b)) => a == b,
            (Type(a), Type(b)) => a == b,
            (ParentValueType { index: a }, ParentValueType { index: b }) => a == b,
            (FixedArray(a), FixedArray(b)) => a == b,
            _ => false,
        }
    }
}

impl PartialEq for FixedArray {
    fn eq(&self, other: &Self) -> bool {
        use FixedArray::*;
        match (self, other) {
            (Boolean(a), Boolean(b)) => a == b,
            (Char(a), Char(b)) => a == b,
            (I1(a), I1(b)) => a == b,
            (U1(a), U1(b)) => a == b,
            (I2(a), I2(b)) => a == b,
            (U2(a), U2(b)) => a == b,
            (I4(a), I4(b)) => a == b,
            (U4(a), U4(b)) => a == b,
            (I8(a), I8(b)) => a == b,
            (U8(a), U8(b)) => a == b,
            (R4(a), R4(b)) => a.iter().map(|x| x.to_bits()).eq(b.iter().map(|x| x.to_bits())),
            (R8(a), R8(b)) => a.iter().map(|x| x.to_bits()).eq(b.iter().map(|x| x.to_bits())),
            _ => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SuspendPolicy {
    None,
    EventThread,
    All,
}

impl SuspendPolicy {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(SuspendPolicy::None),
            1 => Some(SuspendPolicy::EventThread),
            2 => Some(SuspendPolicy::All),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            SuspendPolicy::None => 0,
            SuspendPolicy::EventThread => 1,
            SuspendPolicy::All => 2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepDepth {
    Into,
    Over,
    Out,
}

impl StepDepth {
    pub fn as_i32(self) -> i32 {
        match self {
            StepDepth::Into => 0,
            StepDepth::Over => 1,
            StepDepth::Out => 2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepSize {
    Min,
    Line,
}

impl StepSize {
    pub fn as_i32(self) -> i32 {
        match self {
            StepSize::Min => 0,
            StepSize::Line => 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameInfo {
    pub frame_id: FrameId,
    pub method_id: MethodId,
    pub il_offset: i32,
    pub flags: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypeInfo {
    pub namespace: String,
    pub name: String,
    pub full_name: String,
    pub assembly: AssemblyId,
    pub module: ModuleId,
    pub base_type: TypeId,
    pub element_type: TypeId,
    pub token: i32,
    pub rank: u8,
    pub attributes: i32,
    pub is_byref: bool,
    pub is_pointer: bool,
    pub is_primitive: bool,
    pub is_valuetype: bool,
    pub is_enum: bool,
    pub nested: Vec<TypeId>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldInfo {
    pub field_id: FieldId,
    pub name: String,
    pub type_id: TypeId,
    pub attributes: i32,
}

/// Reply to `FIELD.GET_INFO`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldDetails {
    pub name: String,
    pub parent: TypeId,
    pub type_id: TypeId,
    pub attributes: i32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodInfo {
    pub attributes: i32,
    pub impl_attributes: i32,
    pub token: i32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParamInfo {
    pub call_convention: i32,
    pub generic_param_count: i32,
    pub return_type: TypeId,
    pub param_types: Vec<TypeId>,
    pub param_names: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalInfo {
    pub type_id: TypeId,
    pub name: String,
    pub live_start: i32,
    pub live_end: i32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LineEntry {
    pub il_offset: i32,
    pub line: i32,
    /// Index into [`MethodDebugInfo::source_files`]; `None` when the peer
    /// has no source for this entry.
    pub source_index: Option<usize>,
    /// `None` when the peer predates line-table columns.
    pub column: Option<i32>,
    /// `None` when the peer predates line-table end positions.
    pub end_line: Option<i32>,
    pub end_column: Option<i32>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodDebugInfo {
    pub max_il_offset: i32,
    pub source_files: Vec<String>,
    pub lines: Vec<LineEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: String,
    pub scope_name: String,
    pub fully_qualified_name: String,
    pub guid: String,
    pub assembly: AssemblyId,
}

/// Reply to `OBJECT_REF.GET_INFO`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectInfo {
    pub type_id: TypeId,
    pub domain_id: DomainId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadInfo {
    pub is_thread_pool: bool,
}

/// Reply to `ARRAY_REF.GET_LENGTH`: one `(length, lower_bound)` pair per dimension.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArrayBounds {
    pub dimensions: Vec<(i32, i32)>,
}

impl ArrayBounds {
    pub fn rank(&self) -> usize {
        self.dimensions.len()
    }

    pub fn total_length(&self) -> i64 {
        self.dimensions
            .iter()
            .map(|(len, _)| i64::from(*len))
            .product()
    }
}
