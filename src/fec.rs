//! Cauchy Reed-Solomon coding over GF(2^8).
//!
//! A block of `k` data chunks is extended with `r` parity chunks so that any
//! `k` of the `k + r` chunks suffice to recover the data. The code is
//! systematic: data chunks travel unmodified, parity is appended.
//!
//! The generator matrix is a normalized Cauchy matrix, fixed entirely by
//! `(k, r)`, so sender and receiver agree on it without negotiation:
//!
//! ```text
//!   a_ij = (y_j + x_0) / (x_i + y_j)
//! ```
//!
//! where `y_j = j` is the data-chunk column, `x_i = k + i` is the parity row
//! and `x_0 = k`. The normalization makes the first parity row all ones, so
//! parity 0 is a plain XOR of the data chunks. Every square submatrix of a
//! Cauchy matrix is invertible, which is what guarantees recovery from any
//! loss pattern of at most `r` chunks.
//!
//! Encoding and decoding are byte-parallel: each byte position of a chunk is
//! an independent codeword, worked on with precomputed multiplication tables.

use gf256::gf::gf;

/// GF(2^8) over the polynomial 0x14d (x^8 + x^6 + x^3 + x^2 + 1).
#[gf(polynomial = 0x14d, generator = 0x2)]
pub type Gf256;

/// Upper bound on `k + r`: chunk indices must fit the field (and one byte).
pub const MAX_TOTAL_CHUNKS: usize = 256;

/// Error type for FEC operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FecError {
    /// Parameter out of range (zero chunk size, zero data chunks).
    InvalidParams,
    /// `k + r` exceeds [`MAX_TOTAL_CHUNKS`].
    TooManyChunks,
    /// Fewer than `missing` parity chunks available for reconstruction.
    InsufficientChunks,
    /// The decode matrix was singular (cannot happen for a Cauchy generator).
    Singular,
}

impl std::fmt::Display for FecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FecError::InvalidParams => write!(f, "invalid coding parameters"),
            FecError::TooManyChunks => write!(f, "k + r > {}", MAX_TOTAL_CHUNKS),
            FecError::InsufficientChunks => write!(f, "not enough chunks to reconstruct"),
            FecError::Singular => write!(f, "singular decode matrix"),
        }
    }
}

impl std::error::Error for FecError {}

/// Coding parameters shared by sender and receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FecParams {
    /// Data chunks per block (1..=255).
    k: usize,
    /// Parity chunks per block (0..=255).
    r: usize,
    /// Bytes per chunk.
    chunk_bytes: usize,
}

impl FecParams {
    /// Create coding parameters.
    ///
    /// `r = 0` is allowed: the code degenerates to plain chunking with no
    /// recovery capacity.
    pub fn new(k: usize, r: usize, chunk_bytes: usize) -> Result<Self, FecError> {
        if k == 0 || chunk_bytes == 0 {
            return Err(FecError::InvalidParams);
        }
        if k + r > MAX_TOTAL_CHUNKS {
            return Err(FecError::TooManyChunks);
        }
        Ok(Self { k, r, chunk_bytes })
    }

    #[inline]
    pub fn k(&self) -> usize {
        self.k
    }

    #[inline]
    pub fn r(&self) -> usize {
        self.r
    }

    #[inline]
    pub fn chunk_bytes(&self) -> usize {
        self.chunk_bytes
    }

    /// Total chunks per block, `k + r`.
    #[inline]
    pub fn total_chunks(&self) -> usize {
        self.k + self.r
    }

    /// Generator coefficient for (parity row, data column).
    ///
    /// `x_i` and `y_j` ranges are disjoint, so the denominator is never zero.
    #[inline]
    fn coefficient(&self, parity_index: usize, data_index: usize) -> Gf256 {
        let x_0 = Gf256(self.k as u8);
        let x_i = Gf256((self.k + parity_index) as u8);
        let y_j = Gf256(data_index as u8);
        (y_j + x_0) / (x_i + y_j)
    }
}

// =============================================================================
// Byte-parallel slice arithmetic
// =============================================================================

/// Multiplication tables for every GF(2^8) coefficient, built at compile time.
///
/// `TABLES[c][x] = c * x`, so multiplying a whole chunk by a coefficient is
/// one table lookup per byte.
struct MulTables {
    tables: [[u8; 256]; 256],
}

impl MulTables {
    const fn build() -> Self {
        let mut tables = [[0u8; 256]; 256];
        let mut c = 0usize;
        while c < 256 {
            let mut x = 0usize;
            while x < 256 {
                tables[c][x] = Self::mul(c as u8, x as u8);
                x += 1;
            }
            c += 1;
        }
        Self { tables }
    }

    /// Shift-and-reduce multiplication for polynomial 0x14d
    /// (x^8 ≡ x^6 + x^3 + x^2 + 1, i.e. reduce overflow with 0x4d).
    const fn mul(mut a: u8, mut b: u8) -> u8 {
        let mut acc = 0u8;
        while b != 0 {
            if b & 1 != 0 {
                acc ^= a;
            }
            let carry = a & 0x80;
            a <<= 1;
            if carry != 0 {
                a ^= 0x4d;
            }
            b >>= 1;
        }
        acc
    }

    #[inline(always)]
    fn row(&self, coeff: u8) -> &[u8; 256] {
        &self.tables[coeff as usize]
    }
}

static MUL_TABLES: MulTables = MulTables::build();

/// dst[i] ^= src[i]
#[inline]
fn xor_slice(dst: &mut [u8], src: &[u8]) {
    debug_assert_eq!(dst.len(), src.len());
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

/// dst[i] ^= src[i] * coeff
#[inline]
fn muladd_slice(dst: &mut [u8], src: &[u8], coeff: Gf256) {
    debug_assert_eq!(dst.len(), src.len());
    if coeff.0 == 0 {
        return;
    }
    if coeff.0 == 1 {
        xor_slice(dst, src);
        return;
    }
    let table = MUL_TABLES.row(coeff.0);
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= table[*s as usize];
    }
}

/// dst[i] = dst[i] * coeff
#[inline]
fn mul_slice_inplace(dst: &mut [u8], coeff: Gf256) {
    if coeff.0 == 0 {
        dst.fill(0);
        return;
    }
    if coeff.0 == 1 {
        return;
    }
    let table = MUL_TABLES.row(coeff.0);
    for d in dst.iter_mut() {
        *d = table[*d as usize];
    }
}

// =============================================================================
// Encoding
// =============================================================================

/// Compute the `r` parity chunks for one block.
///
/// `data` must hold exactly `k` slices of `chunk_bytes` each (the terminal
/// block's slots are zero-padded by the caller). Returns `r` parity chunks of
/// `chunk_bytes` each; empty when `r = 0`.
pub fn encode_parity(params: &FecParams, data: &[&[u8]]) -> Vec<Vec<u8>> {
    debug_assert_eq!(data.len(), params.k);
    debug_assert!(data.iter().all(|c| c.len() == params.chunk_bytes));

    let mut parity = Vec::with_capacity(params.r);
    for p in 0..params.r {
        let mut out = vec![0u8; params.chunk_bytes];
        if p == 0 {
            // First generator row is all ones: plain XOR parity.
            for chunk in data {
                xor_slice(&mut out, chunk);
            }
        } else {
            for (j, chunk) in data.iter().enumerate() {
                muladd_slice(&mut out, chunk, params.coefficient(p, j));
            }
        }
        parity.push(out);
    }
    parity
}

// =============================================================================
// Decoding
// =============================================================================

/// Reconstruct missing data chunks in place.
///
/// `data[j]` holds the received chunk for data slot `j`, or `None` if it was
/// lost. `parity` lists received parity chunks as `(parity_index, bytes)`.
/// On success every slot is `Some` and the number of recovered chunks is
/// returned.
///
/// The missing chunks are found by subtracting the known data contributions
/// from each parity chunk and solving the remaining m-by-m linear system over
/// GF(2^8) by Gaussian elimination. When more parity than needed is present
/// the lowest-indexed parities are used.
pub fn reconstruct(
    params: &FecParams,
    data: &mut [Option<Vec<u8>>],
    parity: &[(usize, &[u8])],
) -> Result<usize, FecError> {
    debug_assert_eq!(data.len(), params.k);

    let missing: Vec<usize> = (0..params.k).filter(|&j| data[j].is_none()).collect();
    let m = missing.len();
    if m == 0 {
        return Ok(0);
    }
    if parity.len() < m {
        return Err(FecError::InsufficientChunks);
    }

    // Right-hand side: parity minus the contributions of the known chunks.
    let mut matrix: Vec<Vec<Gf256>> = vec![vec![Gf256(0); m]; m];
    let mut rhs: Vec<Vec<u8>> = Vec::with_capacity(m);
    for (row, &(p, bytes)) in parity.iter().take(m).enumerate() {
        debug_assert!(p < params.r && bytes.len() == params.chunk_bytes);
        let mut acc = bytes.to_vec();
        for (j, slot) in data.iter().enumerate() {
            if let Some(chunk) = slot {
                muladd_slice(&mut acc, chunk, params.coefficient(p, j));
            }
        }
        for (col, &j) in missing.iter().enumerate() {
            matrix[row][col] = params.coefficient(p, j);
        }
        rhs.push(acc);
    }

    gaussian_eliminate(&mut matrix, &mut rhs).ok_or(FecError::Singular)?;

    for (col, j) in missing.into_iter().enumerate() {
        data[j] = Some(std::mem::take(&mut rhs[col]));
    }
    Ok(m)
}

/// Solve `matrix * x = rhs` in place; `rhs` holds the solutions on return.
///
/// Returns `None` if no pivot can be found for some column.
fn gaussian_eliminate(matrix: &mut [Vec<Gf256>], rhs: &mut [Vec<u8>]) -> Option<()> {
    let n = matrix.len();

    for col in 0..n {
        let pivot_row = (col..n).find(|&row| matrix[row][col].0 != 0)?;
        if pivot_row != col {
            matrix.swap(col, pivot_row);
            rhs.swap(col, pivot_row);
        }

        let pivot_inv = Gf256(1) / matrix[col][col];
        for j in col..n {
            matrix[col][j] = matrix[col][j] * pivot_inv;
        }
        mul_slice_inplace(&mut rhs[col], pivot_inv);

        for row in (col + 1)..n {
            let factor = matrix[row][col];
            if factor.0 == 0 {
                continue;
            }
            for j in col..n {
                let above = matrix[col][j];
                matrix[row][j] = matrix[row][j] + above * factor;
            }
            let (head, tail) = rhs.split_at_mut(row);
            muladd_slice(&mut tail[0], &head[col], factor);
        }
    }

    // Back substitution; only the right-hand side matters from here on.
    for col in (1..n).rev() {
        for row in 0..col {
            let factor = matrix[row][col];
            if factor.0 == 0 {
                continue;
            }
            let (head, tail) = rhs.split_at_mut(col);
            muladd_slice(&mut head[row], &tail[0], factor);
        }
    }

    Some(())
}
