//! Message flag bitmasks and the fixed-width on-disk flag field.
//!
//! The flag field of every internal header is exactly 12 octal digits:
//! 10 digits of user-flag bitmap followed by 2 digits of system flags.
//! User flags are stored in reverse bit order (keyword `i` occupies disk
//! bit `29 - i`) — a legacy encoding replicated here exactly for
//! byte-compatibility with existing mailbox files.

/// Width of the on-disk flag field in bytes (digits).
pub const FLAG_FIELD_WIDTH: usize = 12;

/// Maximum number of named user flags a mailbox can define.
pub const MAX_USER_FLAGS: usize = 30;

/// System flag bits, as stored in the low 2 octal digits of the field.
///
/// `OLD` is the historical "not recent" marker: absent on a freshly
/// delivered record, stamped in during the stream's flag sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SystemFlags(u8);

impl SystemFlags {
    pub const SEEN: SystemFlags = SystemFlags(0o01);
    pub const DELETED: SystemFlags = SystemFlags(0o02);
    pub const FLAGGED: SystemFlags = SystemFlags(0o04);
    pub const ANSWERED: SystemFlags = SystemFlags(0o10);
    pub const OLD: SystemFlags = SystemFlags(0o20);
    pub const DRAFT: SystemFlags = SystemFlags(0o40);

    /// Flags a caller may set or clear; `OLD` is engine-internal.
    pub const SETTABLE: SystemFlags = SystemFlags(0o57);

    pub fn empty() -> SystemFlags {
        SystemFlags(0)
    }

    pub fn all() -> SystemFlags {
        SystemFlags(0o77)
    }

    pub fn from_bits(bits: u8) -> Option<SystemFlags> {
        if bits & !0o77 != 0 {
            return None;
        }
        Some(SystemFlags(bits))
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: SystemFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: SystemFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: SystemFlags) {
        self.0 &= !other.0;
    }

    pub fn intersection(self, other: SystemFlags) -> SystemFlags {
        SystemFlags(self.0 & other.0)
    }
}

impl std::ops::BitOr for SystemFlags {
    type Output = SystemFlags;

    fn bitor(self, rhs: SystemFlags) -> SystemFlags {
        SystemFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for SystemFlags {
    fn bitor_assign(&mut self, rhs: SystemFlags) {
        self.0 |= rhs.0;
    }
}

/// Bitmap of up to 30 named user flags, in natural (in-memory) bit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UserFlags(u32);

impl UserFlags {
    pub fn empty() -> UserFlags {
        UserFlags(0)
    }

    pub fn from_bits(bits: u32) -> UserFlags {
        UserFlags(bits & ((1 << MAX_USER_FLAGS) - 1))
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains_bit(self, index: usize) -> bool {
        index < MAX_USER_FLAGS && self.0 & (1 << index) != 0
    }

    pub fn insert(&mut self, other: UserFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: UserFlags) {
        self.0 &= !other.0;
    }

    /// Transform to the on-disk bit order (keyword `i` → disk bit `29-i`).
    /// The reversal is an involution, so the inverse is the same transform.
    pub fn to_disk(self) -> u32 {
        reverse30(self.0)
    }

    /// Inverse of [`UserFlags::to_disk`].
    pub fn from_disk(bits: u32) -> UserFlags {
        UserFlags(reverse30(bits & ((1 << MAX_USER_FLAGS) - 1)))
    }
}

impl std::ops::BitOr for UserFlags {
    type Output = UserFlags;

    fn bitor(self, rhs: UserFlags) -> UserFlags {
        UserFlags(self.0 | rhs.0)
    }
}

fn reverse30(bits: u32) -> u32 {
    let mut out = 0;
    for i in 0..MAX_USER_FLAGS {
        if bits & (1 << i) != 0 {
            out |= 1 << (MAX_USER_FLAGS - 1 - i);
        }
    }
    out
}

/// Codec for the 12-digit flag field itself.
pub struct FlagField;

impl FlagField {
    /// Encode to exactly [`FLAG_FIELD_WIDTH`] octal digits.
    pub fn encode(user: UserFlags, system: SystemFlags) -> String {
        format!("{:010o}{:02o}", user.to_disk(), system.bits())
    }

    /// Decode from exactly [`FLAG_FIELD_WIDTH`] octal digits.
    pub fn decode(field: &[u8]) -> Result<(UserFlags, SystemFlags), String> {
        if field.len() != FLAG_FIELD_WIDTH {
            return Err(format!(
                "flag field is {} bytes, expected {FLAG_FIELD_WIDTH}",
                field.len()
            ));
        }
        let mut user: u32 = 0;
        for &b in &field[..10] {
            if !(b'0'..=b'7').contains(&b) {
                return Err(format!("non-octal digit 0x{b:02x} in user flag field"));
            }
            user = user * 8 + (b - b'0') as u32;
        }
        let mut system: u8 = 0;
        for &b in &field[10..] {
            if !(b'0'..=b'7').contains(&b) {
                return Err(format!("non-octal digit 0x{b:02x} in system flag field"));
            }
            system = system * 8 + (b - b'0');
        }
        Ok((
            UserFlags::from_disk(user),
            SystemFlags(system),
        ))
    }
}

/// Per-mailbox table of named user flags (keywords).
///
/// Names resolve to bit indices; new names are defined on demand while
/// slots remain. Lookup is case-insensitive, as keyword matching is in the
/// protocols that consume this engine.
#[derive(Debug, Default)]
pub struct KeywordTable {
    names: Vec<String>,
}

impl KeywordTable {
    pub fn new() -> KeywordTable {
        KeywordTable { names: Vec::new() }
    }

    /// Resolve a keyword name to its bit, optionally defining it.
    /// Returns `None` for unknown names (when not defining) or when the
    /// table is full.
    pub fn resolve(&mut self, name: &str, define: bool) -> Option<UserFlags> {
        if let Some(i) = self
            .names
            .iter()
            .position(|n| n.eq_ignore_ascii_case(name))
        {
            return Some(UserFlags(1 << i));
        }
        if define && self.names.len() < MAX_USER_FLAGS && !name.is_empty() {
            self.names.push(name.to_string());
            return Some(UserFlags(1 << (self.names.len() - 1)));
        }
        None
    }

    /// Defined keyword names, in bit order.
    pub fn names(&self) -> &[String] {
        &self.names
    }
}
