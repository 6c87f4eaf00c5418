//! # Finite Field Primitive
//!
//! Byte-packed arithmetic over GF(2), GF(4), GF(16) and GF(256).
//!
//! Coefficients of the smaller fields are packed several to a byte, least
//! significant bits first. A coded row is therefore treated as a vector of
//! field elements regardless of whether a byte holds coefficients or payload:
//!
//! ```text
//! GF(4), exponent 2, four elements per byte
//!
//!   bit   7 6 | 5 4 | 3 2 | 1 0
//!   col    3  |  2  |  1  |  0
//! ```
//!
//! Row operations go through per-field lookup tables that map a whole byte to
//! its product with a coefficient, so GF(2) to GF(256) share a single code path.
//! The tables are built once per field on first use and shared by every
//! [`Field`] handle.

use std::fmt;
use std::sync::LazyLock;

use gf256::gf::gf;

// GF(256) element type. Polynomial x^8 + x^4 + x^3 + x^2 + 1, generator 2.
#[gf(polynomial = 0x11d, generator = 0x2)]
pub type Gf256;

/// Reduction polynomial for GF(4): x^2 + x + 1.
const GF4_POLYNOMIAL: u16 = 0x7;

/// Reduction polynomial for GF(16): x^4 + x + 1.
const GF16_POLYNOMIAL: u16 = 0x13;

// =============================================================================
// Field Type
// =============================================================================

/// Field selector, encoded in the low two bits of the coded header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum FieldType {
    Gf2 = 0,
    Gf4 = 1,
    Gf16 = 2,
    #[default]
    Gf256 = 3,
}

impl FieldType {
    /// Decode a 2-bit wire selector.
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::Gf2),
            1 => Some(Self::Gf4),
            2 => Some(Self::Gf16),
            3 => Some(Self::Gf256),
            _ => None,
        }
    }

    /// Wire selector value.
    #[inline]
    pub fn bits(self) -> u8 {
        self as u8
    }

    /// Bits per element.
    #[inline]
    pub fn exponent(self) -> usize {
        match self {
            Self::Gf2 => 1,
            Self::Gf4 => 2,
            Self::Gf16 => 4,
            Self::Gf256 => 8,
        }
    }

    /// Mask selecting one element from the low bits of a byte.
    #[inline]
    pub fn mask(self) -> u8 {
        match self {
            Self::Gf2 => 0x01,
            Self::Gf4 => 0x03,
            Self::Gf16 => 0x0f,
            Self::Gf256 => 0xff,
        }
    }

    /// Number of field elements.
    #[inline]
    pub fn order(self) -> usize {
        1 << self.exponent()
    }

    /// Multiply two single elements.
    fn element_mul(self, a: u8, b: u8) -> u8 {
        match self {
            Self::Gf2 => a & b,
            Self::Gf4 => carryless_mul(a, b, 2, GF4_POLYNOMIAL),
            Self::Gf16 => carryless_mul(a, b, 4, GF16_POLYNOMIAL),
            Self::Gf256 => (Gf256(a) * Gf256(b)).0,
        }
    }

    /// Multiplicative inverse of a nonzero element.
    fn element_inv(self, a: u8) -> u8 {
        match self {
            Self::Gf256 => (Gf256(1) / Gf256(a)).0,
            _ => (1..self.order() as u16)
                .map(|b| b as u8)
                .find(|&b| self.element_mul(a, b) == 1)
                .unwrap_or(0),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gf2 => write!(f, "GF(2)"),
            Self::Gf4 => write!(f, "GF(4)"),
            Self::Gf16 => write!(f, "GF(16)"),
            Self::Gf256 => write!(f, "GF(256)"),
        }
    }
}

/// Polynomial multiplication followed by reduction, for fields up to 2^8.
const fn carryless_mul(a: u8, b: u8, exponent: u32, polynomial: u16) -> u8 {
    let mut result = 0u16;
    let mut aa = a as u16;
    let mut bb = b;

    while bb != 0 {
        if bb & 1 != 0 {
            result ^= aa;
        }
        aa <<= 1;
        bb >>= 1;
    }

    let mut i = 2 * exponent as i32 - 2;
    while i >= exponent as i32 {
        if result & (1 << i) != 0 {
            result ^= polynomial << (i - exponent as i32);
        }
        i -= 1;
    }

    result as u8
}

// =============================================================================
// Lookup Tables
// =============================================================================

/// Packed multiplication tables for one field.
///
/// `mul[c][x]` is the byte `x`, read as `8 / exponent` packed elements, with
/// every element multiplied by `c`.
struct Tables {
    mul: Box<[[u8; 256]]>,
    inv: [u8; 256],
}

impl Tables {
    fn build(kind: FieldType) -> Self {
        let exponent = kind.exponent();
        let mask = kind.mask();
        let order = kind.order();

        let mut mul = vec![[0u8; 256]; order].into_boxed_slice();
        for (c, table) in mul.iter_mut().enumerate() {
            for (x, out) in table.iter_mut().enumerate() {
                let mut packed = 0u8;
                for shift in (0..8).step_by(exponent) {
                    let element = (x >> shift) as u8 & mask;
                    packed |= kind.element_mul(element, c as u8) << shift;
                }
                *out = packed;
            }
        }

        let mut inv = [0u8; 256];
        for (a, out) in inv.iter_mut().enumerate().take(order).skip(1) {
            *out = kind.element_inv(a as u8);
        }

        Self { mul, inv }
    }
}

static GF2_TABLES: LazyLock<Tables> = LazyLock::new(|| Tables::build(FieldType::Gf2));
static GF4_TABLES: LazyLock<Tables> = LazyLock::new(|| Tables::build(FieldType::Gf4));
static GF16_TABLES: LazyLock<Tables> = LazyLock::new(|| Tables::build(FieldType::Gf16));
static GF256_TABLES: LazyLock<Tables> = LazyLock::new(|| Tables::build(FieldType::Gf256));

// =============================================================================
// Field Handle
// =============================================================================

/// Arithmetic handle for one field, selected once per session.
#[derive(Clone, Copy)]
pub struct Field {
    kind: FieldType,
    tables: &'static Tables,
}

impl Field {
    pub fn new(kind: FieldType) -> Self {
        let tables: &'static Tables = match kind {
            FieldType::Gf2 => &GF2_TABLES,
            FieldType::Gf4 => &GF4_TABLES,
            FieldType::Gf16 => &GF16_TABLES,
            FieldType::Gf256 => &GF256_TABLES,
        };
        Self { kind, tables }
    }

    #[inline]
    pub fn kind(&self) -> FieldType {
        self.kind
    }

    #[inline]
    pub fn exponent(&self) -> usize {
        self.kind.exponent()
    }

    #[inline]
    pub fn mask(&self) -> u8 {
        self.kind.mask()
    }

    /// Multiply two elements.
    #[inline]
    pub fn mul(&self, a: u8, b: u8) -> u8 {
        let mask = self.mask();
        self.tables.mul[(b & mask) as usize][(a & mask) as usize] & mask
    }

    /// Inverse of a nonzero element. Zero maps to zero.
    #[inline]
    pub fn inv(&self, a: u8) -> u8 {
        debug_assert!(a & self.mask() != 0, "inverse of zero");
        self.tables.inv[(a & self.mask()) as usize]
    }

    /// `dst[i] += src[i] * coefficient` over packed elements.
    pub fn muladd_row(&self, dst: &mut [u8], src: &[u8], coefficient: u8) {
        debug_assert_eq!(dst.len(), src.len());

        let coefficient = coefficient & self.mask();
        if coefficient == 0 {
            return;
        }
        if coefficient == 1 {
            for (d, s) in dst.iter_mut().zip(src) {
                *d ^= *s;
            }
            return;
        }

        let table = &self.tables.mul[coefficient as usize];
        for (d, s) in dst.iter_mut().zip(src) {
            *d ^= table[*s as usize];
        }
    }

    /// `row[i] *= coefficient` over packed elements.
    pub fn scale_row(&self, row: &mut [u8], coefficient: u8) {
        let coefficient = coefficient & self.mask();
        match coefficient {
            0 => row.fill(0),
            1 => {}
            c => {
                let table = &self.tables.mul[c as usize];
                for b in row.iter_mut() {
                    *b = table[*b as usize];
                }
            }
        }
    }

    /// Bytes needed for a coefficient vector of `count` elements.
    #[inline]
    pub fn coefficient_bytes(&self, count: usize) -> usize {
        (count * self.exponent()).div_ceil(8)
    }

    /// Read the element at column `col` of a packed coefficient vector.
    #[inline]
    pub fn coefficient(&self, row: &[u8], col: usize) -> u8 {
        let bit = col * self.exponent();
        (row[bit / 8] >> (bit % 8)) & self.mask()
    }

    /// Write the element at column `col` of a packed coefficient vector.
    #[inline]
    pub fn set_coefficient(&self, row: &mut [u8], col: usize, value: u8) {
        let bit = col * self.exponent();
        let pos = bit % 8;
        let byte = &mut row[bit / 8];
        *byte &= !(self.mask() << pos);
        *byte |= (value & self.mask()) << pos;
    }
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field").field("kind", &self.kind).finish()
    }
}

impl PartialEq for Field {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

impl Eq for Field {}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [FieldType; 4] = [
        FieldType::Gf2,
        FieldType::Gf4,
        FieldType::Gf16,
        FieldType::Gf256,
    ];

    #[test]
    fn test_selector_bits() {
        for kind in ALL {
            assert_eq!(FieldType::from_bits(kind.bits()), Some(kind));
        }
        assert_eq!(FieldType::from_bits(4), None);
    }

    #[test]
    fn test_inverse_all_fields() {
        for kind in ALL {
            let field = Field::new(kind);
            for a in 1..kind.order() as u16 {
                let a = a as u8;
                assert_eq!(field.mul(a, field.inv(a)), 1, "{kind} a={a}");
            }
        }
    }

    #[test]
    fn test_carryless_matches_gf256_crate() {
        for a in 0..=255u8 {
            for b in [0u8, 1, 2, 0x53, 0xca, 0xff] {
                assert_eq!(carryless_mul(a, b, 8, 0x11d), (Gf256(a) * Gf256(b)).0);
            }
        }
    }

    #[test]
    fn test_gf4_multiplication_table() {
        // GF(4) = {0, 1, x, x+1}
        let field = Field::new(FieldType::Gf4);
        assert_eq!(field.mul(2, 2), 3);
        assert_eq!(field.mul(2, 3), 1);
        assert_eq!(field.mul(3, 3), 2);
        assert_eq!(field.inv(2), 3);
    }

    #[test]
    fn test_packed_muladd_matches_elementwise() {
        for kind in ALL {
            let field = Field::new(kind);
            let src: Vec<u8> = (0..64u8).map(|i| i.wrapping_mul(37).wrapping_add(11)).collect();
            let base: Vec<u8> = (0..64u8).map(|i| i.wrapping_mul(91)).collect();
            let coefficient = (kind.order() - 1) as u8;

            let mut dst = base.clone();
            field.muladd_row(&mut dst, &src, coefficient);

            let elements = 64 * 8 / kind.exponent();
            for col in 0..elements {
                let expected = field.coefficient(&base, col)
                    ^ field.mul(field.coefficient(&src, col), coefficient);
                assert_eq!(field.coefficient(&dst, col), expected, "{kind} col={col}");
            }
        }
    }

    #[test]
    fn test_scale_then_inverse_restores_row() {
        for kind in ALL {
            let field = Field::new(kind);
            let original: Vec<u8> = (0..32u8).collect();
            let mut row = original.clone();
            let c = if kind == FieldType::Gf2 { 1 } else { 2 };
            field.scale_row(&mut row, c);
            field.scale_row(&mut row, field.inv(c));
            assert_eq!(row, original);
        }
    }

    #[test]
    fn test_coefficient_accessor() {
        let field = Field::new(FieldType::Gf4);
        let mut row = vec![0u8; field.coefficient_bytes(6)];
        assert_eq!(row.len(), 2);

        field.set_coefficient(&mut row, 0, 1);
        field.set_coefficient(&mut row, 3, 3);
        field.set_coefficient(&mut row, 5, 2);
        assert_eq!(row, vec![0b1100_0001, 0b0000_1000]);

        field.set_coefficient(&mut row, 3, 0);
        assert_eq!(field.coefficient(&row, 3), 0);
        assert_eq!(field.coefficient(&row, 0), 1);
        assert_eq!(field.coefficient(&row, 5), 2);
    }

    #[test]
    fn test_coefficient_bytes() {
        assert_eq!(Field::new(FieldType::Gf2).coefficient_bytes(32), 4);
        assert_eq!(Field::new(FieldType::Gf2).coefficient_bytes(10), 2);
        assert_eq!(Field::new(FieldType::Gf16).coefficient_bytes(5), 3);
        assert_eq!(Field::new(FieldType::Gf256).coefficient_bytes(32), 32);
    }
}
