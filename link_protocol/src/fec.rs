// fec.rs — Reed-Solomon outer code with column interleaving
//
// RS(16, 12) over GF(256), primitive polynomial 0x11D, generator roots
// α^0..α^3. Each 12-byte chunk becomes a 16-byte codeword; codewords are
// column-interleaved so an on-air burst lands in different codewords.

use once_cell::sync::Lazy;

use crate::RS_OFF;

/// Parity bytes per codeword. The decoder corrects up to NPAR/2 errors.
pub const NPAR: usize = 4;
pub const RS_BLOCK_SIZE: usize = 16;
pub const DATA_BLOCK_SIZE: usize = RS_BLOCK_SIZE - NPAR;
/// Fill byte for the tail of the last data block.
pub const RS_PADDING: u8 = 0x00;

const PRIMITIVE_POLY: u16 = 0x11D;

struct Tables {
    exp: [u8; 512],
    log: [u8; 256],
    gen: [u8; NPAR + 1],
}

static TABLES: Lazy<Tables> = Lazy::new(|| {
    let mut exp = [0u8; 512];
    let mut log = [0u8; 256];
    let mut x: u16 = 1;
    for i in 0..255 {
        exp[i] = x as u8;
        log[x as usize] = i as u8;
        x <<= 1;
        if x & 0x100 != 0 {
            x ^= PRIMITIVE_POLY;
        }
    }
    for i in 255..512 {
        exp[i] = exp[i - 255];
    }

    let mul = |a: u8, b: u8| -> u8 {
        if a == 0 || b == 0 {
            0
        } else {
            exp[log[a as usize] as usize + log[b as usize] as usize]
        }
    };

    // generator polynomial Π (x ⊕ α^i), i in 0..NPAR, leading coefficient first
    let mut gen = [0u8; NPAR + 1];
    gen[0] = 1;
    let mut deg = 0;
    for i in 0..NPAR {
        let root = exp[i];
        let mut next = [0u8; NPAR + 1];
        for k in 0..=deg {
            next[k] ^= gen[k];
            next[k + 1] ^= mul(gen[k], root);
        }
        gen = next;
        deg += 1;
    }

    Tables { exp, log, gen }
});

#[inline]
fn gf_mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    let t = &*TABLES;
    t.exp[t.log[a as usize] as usize + t.log[b as usize] as usize]
}

#[inline]
fn gf_div(a: u8, b: u8) -> u8 {
    debug_assert!(b != 0);
    if a == 0 {
        return 0;
    }
    let t = &*TABLES;
    t.exp[t.log[a as usize] as usize + 255 - t.log[b as usize] as usize]
}

#[inline]
fn alpha_pow(d: usize) -> u8 {
    TABLES.exp[d % 255]
}

/// Evaluate a polynomial (leading coefficient first) at `x`.
fn poly_eval(p: &[u8], x: u8) -> u8 {
    let mut y = 0;
    for &c in p {
        y = gf_mul(y, x) ^ c;
    }
    y
}

// ================================ Encoder ===================================

fn encode_block(block: &[u8; DATA_BLOCK_SIZE]) -> [u8; RS_BLOCK_SIZE] {
    let gen = &TABLES.gen;
    // systematic: parity = remainder of block · x^NPAR mod generator
    let mut buf = [0u8; RS_BLOCK_SIZE];
    buf[..DATA_BLOCK_SIZE].copy_from_slice(block);
    for i in 0..DATA_BLOCK_SIZE {
        let coef = buf[i];
        if coef != 0 {
            for j in 1..=NPAR {
                buf[i + j] ^= gf_mul(gen[j], coef);
            }
        }
    }
    let mut cw = [0u8; RS_BLOCK_SIZE];
    cw[..DATA_BLOCK_SIZE].copy_from_slice(block);
    cw[DATA_BLOCK_SIZE..].copy_from_slice(&buf[DATA_BLOCK_SIZE..]);
    cw
}

/// Encode `data` into `ceil(len/12)` interleaved 16-byte codewords. The
/// last block is zero-padded.
pub fn encode(data: &[u8]) -> Vec<u8> {
    if data.is_empty() {
        return Vec::new();
    }
    let codewords: Vec<[u8; RS_BLOCK_SIZE]> = data
        .chunks(DATA_BLOCK_SIZE)
        .map(|chunk| {
            let mut block = [RS_PADDING; DATA_BLOCK_SIZE];
            block[..chunk.len()].copy_from_slice(chunk);
            encode_block(&block)
        })
        .collect();

    let n = codewords.len();
    let mut out = vec![0u8; n * RS_BLOCK_SIZE];
    for (row, cw) in codewords.iter().enumerate() {
        for (col, &byte) in cw.iter().enumerate() {
            out[col * n + row] = byte;
        }
    }
    out
}

// ================================ Decoder ===================================

/// Uncorrectable frame. `data` still holds the best-effort deinterleaved
/// data bytes so the caller can peek at the header for a NACK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FecFailure {
    pub data: Vec<u8>,
}

/// Decode an interleaved frame back to `n * 12` data bytes (parity
/// stripped, padding left in place).
pub fn decode(frame: &[u8]) -> Result<Vec<u8>, FecFailure> {
    if frame.is_empty() || frame.len() % RS_BLOCK_SIZE != 0 {
        return Err(FecFailure {
            data: frame.to_vec(),
        });
    }
    let n = frame.len() / RS_BLOCK_SIZE;
    let mut ok = true;
    let mut out = Vec::with_capacity(n * DATA_BLOCK_SIZE);
    for row in 0..n {
        let mut cw = [0u8; RS_BLOCK_SIZE];
        for (col, byte) in cw.iter_mut().enumerate() {
            *byte = frame[col * n + row];
        }
        if !correct_codeword(&mut cw) {
            ok = false;
        }
        out.extend_from_slice(&cw[..DATA_BLOCK_SIZE]);
    }
    if ok {
        Ok(out)
    } else {
        Err(FecFailure { data: out })
    }
}

/// True iff the raw frame length is a non-zero multiple of the block size
/// and the byte where the ECC tag would sit is not RS_OFF. Beacons and
/// other plain frames fail this test.
pub fn is_ecc_frame(frame: &[u8]) -> bool {
    !frame.is_empty() && frame.len() % RS_BLOCK_SIZE == 0 && frame[1] != RS_OFF
}

fn syndromes(cw: &[u8; RS_BLOCK_SIZE]) -> [u8; NPAR] {
    let mut out = [0u8; NPAR];
    for (j, s) in out.iter_mut().enumerate() {
        *s = poly_eval(cw, alpha_pow(j));
    }
    out
}

/// Syndrome-correct one codeword in place. Returns false when the error
/// pattern exceeds the code's correction capability.
fn correct_codeword(cw: &mut [u8; RS_BLOCK_SIZE]) -> bool {
    let synd = syndromes(cw);
    if synd.iter().all(|&s| s == 0) {
        return true;
    }
    correct_single(cw, &synd) || correct_double(cw, &synd)
}

/// Single error: S_j = e·X^j, so X = S1/S0 and e = S0. The remaining
/// syndromes must be consistent or more than one byte is wrong.
fn correct_single(cw: &mut [u8; RS_BLOCK_SIZE], synd: &[u8; NPAR]) -> bool {
    if synd[0] == 0 {
        return false;
    }
    let x = gf_div(synd[1], synd[0]);
    if x == 0
        || synd[2] != gf_mul(synd[1], x)
        || synd[3] != gf_mul(synd[2], x)
    {
        return false;
    }
    let degree = TABLES.log[x as usize] as usize;
    if degree >= RS_BLOCK_SIZE {
        return false;
    }
    cw[RS_BLOCK_SIZE - 1 - degree] ^= synd[0];
    syndromes(cw).iter().all(|&s| s == 0)
}

/// Two errors: solve the locator σ(x) = x² + σ1·x + σ2 from the syndrome
/// equations, find its roots among the 16 valid positions, then the error
/// magnitudes from S0 and S1. Verification against all syndromes guards
/// against miscorrection of heavier error patterns.
fn correct_double(cw: &mut [u8; RS_BLOCK_SIZE], synd: &[u8; NPAR]) -> bool {
    let det = gf_mul(synd[1], synd[1]) ^ gf_mul(synd[0], synd[2]);
    if det == 0 {
        return false;
    }
    let sigma1 = gf_div(gf_mul(synd[1], synd[2]) ^ gf_mul(synd[0], synd[3]), det);
    let sigma2 = gf_div(gf_mul(synd[1], synd[3]) ^ gf_mul(synd[2], synd[2]), det);
    if sigma2 == 0 {
        return false;
    }

    let mut roots = [0usize; 2];
    let mut found = 0;
    for degree in 0..RS_BLOCK_SIZE {
        let x = alpha_pow(degree);
        if gf_mul(x, x) ^ gf_mul(sigma1, x) ^ sigma2 == 0 {
            if found == 2 {
                return false;
            }
            roots[found] = degree;
            found += 1;
        }
    }
    if found != 2 {
        return false;
    }

    let x1 = alpha_pow(roots[0]);
    let x2 = alpha_pow(roots[1]);
    let e1 = gf_div(synd[1] ^ gf_mul(synd[0], x2), x1 ^ x2);
    let e2 = synd[0] ^ e1;

    let p1 = RS_BLOCK_SIZE - 1 - roots[0];
    let p2 = RS_BLOCK_SIZE - 1 - roots[1];
    cw[p1] ^= e1;
    cw[p2] ^= e2;
    if syndromes(cw).iter().all(|&s| s == 0) {
        return true;
    }
    // not actually a two-error pattern; restore the frame
    cw[p1] ^= e1;
    cw[p2] ^= e2;
    false
}

// ================================ Tests =====================================
