// Resona
// Copyright (c) 2025 The Project Resona Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `imdct` module implements the inverse Modified Discrete Cosine
//! Transform (IMDCT).
//!
//! The transform follows the Bosi-Goldberg decomposition: a merged
//! reflect-and-rotate pass, a difference/sum butterfly, log2(n) radix-2 DIT
//! passes (with fused kernels for the three innermost levels), a bit-reverse
//! permutation, and two post-rotation passes. All trigonometric twiddles and
//! the bit-reverse index table are precomputed per transform length.
//!
//! The computed transform is `y[i] = sum x[j]*cos(pi/(2n)*(2i+1+n/2)*(2j+1))`
//! for `j < n/2`, which carries no normalization factor.

use std::f64::consts::PI;

/// The Inverse Modified Discrete Cosine Transform (IMDCT) for a fixed
/// power-of-two length `n` in `[64, 8192]`. Produces `n` time-domain samples
/// from `n / 2` spectral coefficients.
pub struct Imdct {
    n: usize,
    /// Rotation twiddles, length n/2.
    a: Box<[f32]>,
    /// Output combination twiddles, length n/2.
    b: Box<[f32]>,
    /// Post-rotation twiddles, length n/4.
    c: Box<[f32]>,
    /// Bit-reverse indicies, length n/8.
    bit_reverse: Box<[u16]>,
    /// Working buffer, length n/2.
    scratch: Box<[f32]>,
}

impl Imdct {
    /// Instantiate an IMDCT of length `n`, where `n` is a power-of-two in the
    /// range `[64, 8192]`.
    pub fn new(n: usize) -> Self {
        assert!(n.is_power_of_two());
        assert!(n >= 64 && n <= 8192);

        let n2 = n >> 1;
        let n4 = n >> 2;
        let n8 = n >> 3;

        let nf = n as f64;

        let mut a = vec![0.0f32; n2];
        let mut b = vec![0.0f32; n2];
        let mut c = vec![0.0f32; n4];

        for k in 0..n4 {
            let k2 = 2 * k;
            a[k2 + 0] = (4.0 * k as f64 * PI / nf).cos() as f32;
            a[k2 + 1] = -(4.0 * k as f64 * PI / nf).sin() as f32;
            b[k2 + 0] = (((k2 + 1) as f64) * PI / nf / 2.0).cos() as f32 * 0.5;
            b[k2 + 1] = (((k2 + 1) as f64) * PI / nf / 2.0).sin() as f32 * 0.5;
        }

        for k in 0..n8 {
            let k2 = 2 * k;
            c[k2 + 0] = (2.0 * ((k2 + 1) as f64) * PI / nf).cos() as f32;
            c[k2 + 1] = -(2.0 * ((k2 + 1) as f64) * PI / nf).sin() as f32;
        }

        // The bit-reverse table indexes groups of 4 samples.
        let ld = n.trailing_zeros();

        let mut bit_reverse = vec![0u16; n8];

        for (i, rev) in bit_reverse.iter_mut().enumerate() {
            *rev = ((((i as u32).reverse_bits()) >> (32 - ld + 3)) << 2) as u16;
        }

        Imdct {
            n,
            a: a.into_boxed_slice(),
            b: b.into_boxed_slice(),
            c: c.into_boxed_slice(),
            bit_reverse: bit_reverse.into_boxed_slice(),
            scratch: vec![0.0f32; n2].into_boxed_slice(),
        }
    }

    /// The transform length.
    pub fn len(&self) -> usize {
        self.n
    }

    /// Performs the transform in-place. On entry, `buffer[..n / 2]` holds the
    /// spectral coefficients. On return, `buffer[..n]` holds the time-domain
    /// samples.
    pub fn imdct(&mut self, buffer: &mut [f32]) {
        let n = self.n;

        assert_eq!(buffer.len(), n);

        let n2 = n >> 1;
        let n4 = n >> 2;
        let n8 = n >> 3;

        let a = &self.a[..];
        let buf2 = &mut self.scratch[..];

        // Copy and reflect the spectral data while rotating by the A
        // twiddles (step 0 merged in). The reflection doubles each input, so
        // the final output carries an implicit factor that the B twiddles
        // compensate for.
        {
            let mut d = n2 as isize - 2;
            let mut aa = 0;
            let mut e = 0;

            while e != n2 {
                let di = d as usize;
                buf2[di + 1] = buffer[e] * a[aa + 0] - buffer[e + 2] * a[aa + 1];
                buf2[di + 0] = buffer[e] * a[aa + 1] + buffer[e + 2] * a[aa + 0];
                d -= 2;
                aa += 2;
                e += 4;
            }

            let mut e = n2 as isize - 3;

            while d >= 0 {
                let di = d as usize;
                let ei = e as usize;
                buf2[di + 1] = -buffer[ei + 2] * a[aa + 0] + buffer[ei] * a[aa + 1];
                buf2[di + 0] = -buffer[ei + 2] * a[aa + 1] - buffer[ei] * a[aa + 0];
                d -= 2;
                aa += 2;
                e -= 4;
            }
        }

        // Step 2: difference/sum butterfly with the trailing A twiddles.
        // Reads the scratch buffer and writes back into the main buffer.
        {
            let mut aa = n2 as isize - 8;

            let mut e0 = n4;
            let mut e1 = 0;

            let mut d0 = n4;
            let mut d1 = 0;

            while aa >= 0 {
                let ai = aa as usize;

                let v41_21 = buf2[e0 + 1] - buf2[e1 + 1];
                let v40_20 = buf2[e0 + 0] - buf2[e1 + 0];
                buffer[d0 + 1] = buf2[e0 + 1] + buf2[e1 + 1];
                buffer[d0 + 0] = buf2[e0 + 0] + buf2[e1 + 0];
                buffer[d1 + 1] = v41_21 * a[ai + 4] - v40_20 * a[ai + 5];
                buffer[d1 + 0] = v40_20 * a[ai + 4] + v41_21 * a[ai + 5];

                let v41_21 = buf2[e0 + 3] - buf2[e1 + 3];
                let v40_20 = buf2[e0 + 2] - buf2[e1 + 2];
                buffer[d0 + 3] = buf2[e0 + 3] + buf2[e1 + 3];
                buffer[d0 + 2] = buf2[e0 + 2] + buf2[e1 + 2];
                buffer[d1 + 3] = v41_21 * a[ai + 0] - v40_20 * a[ai + 1];
                buffer[d1 + 2] = v40_20 * a[ai + 0] + v41_21 * a[ai + 1];

                aa -= 8;

                d0 += 4;
                d1 += 4;
                e0 += 4;
                e1 += 4;
            }
        }

        // Step 3: log2(n) radix-2 DIT passes over the main buffer.
        let ld = n.trailing_zeros() as i32;

        // Iteration 0.
        step3_iter0_loop(n >> 4, buffer, n2 - 1, -(n8 as isize), a);
        step3_iter0_loop(n >> 4, buffer, n2 - 1 - n4, -(n8 as isize), a);

        // Iteration 1.
        step3_inner_r_loop(n >> 5, buffer, n2 - 1 - n8 * 0, -((n >> 4) as isize), a, 16);
        step3_inner_r_loop(n >> 5, buffer, n2 - 1 - n8 * 1, -((n >> 4) as isize), a, 16);
        step3_inner_r_loop(n >> 5, buffer, n2 - 1 - n8 * 2, -((n >> 4) as isize), a, 16);
        step3_inner_r_loop(n >> 5, buffer, n2 - 1 - n8 * 3, -((n >> 4) as isize), a, 16);

        // The r-loop nesting wins while the per-block work is long; switch to
        // the s-loop nesting for the later iterations.
        let mut l = 2;

        while l < (ld - 3) >> 1 {
            let k0 = n >> (l + 2);
            let k0_2 = k0 >> 1;
            let lim = 1usize << (l + 1);

            for i in 0..lim {
                step3_inner_r_loop(
                    n >> (l + 4),
                    buffer,
                    n2 - 1 - k0 * i,
                    -(k0_2 as isize),
                    a,
                    1 << (l + 3),
                );
            }

            l += 1;
        }

        while l < ld - 6 {
            let k0 = n >> (l + 2);
            let k1 = 1usize << (l + 3);
            let k0_2 = k0 >> 1;
            let rlim = n >> (l + 6);
            let lim = 1usize << (l + 1);

            let mut a0 = 0;
            let mut i_off = n2 - 1;

            for _ in 0..rlim {
                step3_inner_s_loop(lim, buffer, i_off, -(k0_2 as isize), &a[a0..], k1, k0);
                a0 += k1 * 4;
                i_off -= 8;
            }

            l += 1;
        }

        // The final three iterations fused together. Their twiddles are
        // mostly trivial (1 and 0), which the fused kernel exploits.
        step3_inner_s_loop_ld654(n >> 5, buffer, n2 - 1, a, n);

        // Step 4: bit-reverse permutation, from the main buffer back into the
        // scratch buffer.
        {
            let bitrev = &self.bit_reverse[..];

            let mut br = 0;
            let mut d0 = n4 as isize - 4;
            let mut d1 = n2 as isize - 4;

            while d0 >= 0 {
                let i0 = d0 as usize;
                let i1 = d1 as usize;

                let k4 = bitrev[br + 0] as usize;
                buf2[i1 + 3] = buffer[k4 + 0];
                buf2[i1 + 2] = buffer[k4 + 1];
                buf2[i0 + 3] = buffer[k4 + 2];
                buf2[i0 + 2] = buffer[k4 + 3];

                let k4 = bitrev[br + 1] as usize;
                buf2[i1 + 1] = buffer[k4 + 0];
                buf2[i1 + 0] = buffer[k4 + 1];
                buf2[i0 + 1] = buffer[k4 + 2];
                buf2[i0 + 0] = buffer[k4 + 3];

                d0 -= 4;
                d1 -= 4;
                br += 2;
            }
        }

        // Step 7: post-rotation with the C twiddles, in-place on the scratch
        // buffer.
        {
            let c = &self.c[..];

            let mut ci = 0;
            let mut d = 0;
            let mut e = n2 - 4;

            while d < e {
                let a02 = buf2[d + 0] - buf2[e + 2];
                let a11 = buf2[d + 1] + buf2[e + 3];

                let b0 = c[ci + 1] * a02 + c[ci + 0] * a11;
                let b1 = c[ci + 1] * a11 - c[ci + 0] * a02;

                let b2 = buf2[d + 0] + buf2[e + 2];
                let b3 = buf2[d + 1] - buf2[e + 3];

                buf2[d + 0] = b2 + b0;
                buf2[d + 1] = b3 + b1;
                buf2[e + 2] = b2 - b0;
                buf2[e + 3] = b1 - b3;

                let a02 = buf2[d + 2] - buf2[e + 0];
                let a11 = buf2[d + 3] + buf2[e + 1];

                let b0 = c[ci + 3] * a02 + c[ci + 2] * a11;
                let b1 = c[ci + 3] * a11 - c[ci + 2] * a02;

                let b2 = buf2[d + 2] + buf2[e + 0];
                let b3 = buf2[d + 3] - buf2[e + 1];

                buf2[d + 2] = b2 + b0;
                buf2[d + 3] = b3 + b1;
                buf2[e + 0] = b2 - b0;
                buf2[e + 1] = b1 - b3;

                ci += 4;
                d += 4;
                e -= 4;
            }
        }

        // Step 8: combine with the B twiddles and write the four output
        // quadrants directly.
        {
            let b = &self.b[..];

            for i in 0..(n2 >> 3) {
                let e = n2 - 8 - 8 * i;
                let bi = n2 - 8 - 8 * i;
                let d0 = 4 * i;
                let d1 = n2 - 4 - 4 * i;
                let d2 = n2 + 4 * i;
                let d3 = n - 4 - 4 * i;

                let p3 = buf2[e + 6] * b[bi + 7] - buf2[e + 7] * b[bi + 6];
                let p2 = -buf2[e + 6] * b[bi + 6] - buf2[e + 7] * b[bi + 7];

                buffer[d0 + 0] = p3;
                buffer[d1 + 3] = -p3;
                buffer[d2 + 0] = p2;
                buffer[d3 + 3] = p2;

                let p1 = buf2[e + 4] * b[bi + 5] - buf2[e + 5] * b[bi + 4];
                let p0 = -buf2[e + 4] * b[bi + 4] - buf2[e + 5] * b[bi + 5];

                buffer[d0 + 1] = p1;
                buffer[d1 + 2] = -p1;
                buffer[d2 + 1] = p0;
                buffer[d3 + 2] = p0;

                let p3 = buf2[e + 2] * b[bi + 3] - buf2[e + 3] * b[bi + 2];
                let p2 = -buf2[e + 2] * b[bi + 2] - buf2[e + 3] * b[bi + 3];

                buffer[d0 + 2] = p3;
                buffer[d1 + 1] = -p3;
                buffer[d2 + 2] = p2;
                buffer[d3 + 1] = p2;

                let p1 = buf2[e + 0] * b[bi + 1] - buf2[e + 1] * b[bi + 0];
                let p0 = -buf2[e + 0] * b[bi + 0] - buf2[e + 1] * b[bi + 1];

                buffer[d0 + 3] = p1;
                buffer[d1 + 0] = -p1;
                buffer[d2 + 3] = p0;
                buffer[d3 + 0] = p0;
            }
        }
    }
}

fn step3_iter0_loop(n: usize, e: &mut [f32], i_off: usize, k_off: isize, a: &[f32]) {
    debug_assert!(n & 3 == 0);

    let mut ee0 = i_off as isize;
    let mut ee2 = ee0 + k_off;
    let mut ai = 0;

    for _ in 0..(n >> 2) {
        for j in 0..4 {
            let i0 = (ee0 - 2 * j) as usize;
            let i1 = i0 - 1;
            let q0 = (ee2 - 2 * j) as usize;
            let q1 = q0 - 1;

            let k00 = e[i0] - e[q0];
            let k01 = e[i1] - e[q1];
            e[i0] += e[q0];
            e[i1] += e[q1];
            e[q0] = k00 * a[ai + 0] - k01 * a[ai + 1];
            e[q1] = k01 * a[ai + 0] + k00 * a[ai + 1];

            ai += 8;
        }

        ee0 -= 8;
        ee2 -= 8;
    }
}

fn step3_inner_r_loop(lim: usize, e: &mut [f32], d0: usize, k_off: isize, a: &[f32], k1: usize) {
    let mut e0 = d0 as isize;
    let mut e2 = e0 + k_off;
    let mut ai = 0;

    for _ in 0..(lim >> 2) {
        for j in 0..4 {
            let i0 = (e0 - 2 * j) as usize;
            let i1 = i0 - 1;
            let q0 = (e2 - 2 * j) as usize;
            let q1 = q0 - 1;

            let k00 = e[i0] - e[q0];
            let k01 = e[i1] - e[q1];
            e[i0] += e[q0];
            e[i1] += e[q1];
            e[q0] = k00 * a[ai + 0] - k01 * a[ai + 1];
            e[q1] = k01 * a[ai + 0] + k00 * a[ai + 1];

            ai += k1;
        }

        e0 -= 8;
        e2 -= 8;
    }
}

fn step3_inner_s_loop(
    n: usize,
    e: &mut [f32],
    i_off: usize,
    k_off: isize,
    a: &[f32],
    a_off: usize,
    k0: usize,
) {
    let a0 = a[0];
    let a1 = a[1];
    let a2 = a[a_off + 0];
    let a3 = a[a_off + 1];
    let a4 = a[a_off * 2 + 0];
    let a5 = a[a_off * 2 + 1];
    let a6 = a[a_off * 3 + 0];
    let a7 = a[a_off * 3 + 1];

    let tw = [(a0, a1), (a2, a3), (a4, a5), (a6, a7)];

    let mut ee0 = i_off as isize;
    let mut ee2 = ee0 + k_off;

    for _ in 0..n {
        for (j, &(t0, t1)) in tw.iter().enumerate() {
            let i0 = (ee0 - 2 * j as isize) as usize;
            let i1 = i0 - 1;
            let q0 = (ee2 - 2 * j as isize) as usize;
            let q1 = q0 - 1;

            let k00 = e[i0] - e[q0];
            let k11 = e[i1] - e[q1];
            e[i0] += e[q0];
            e[i1] += e[q1];
            e[q0] = k00 * t0 - k11 * t1;
            e[q1] = k11 * t0 + k00 * t1;
        }

        ee0 -= k0 as isize;
        ee2 -= k0 as isize;
    }
}

fn iter_54(e: &mut [f32], z: usize) {
    let k00 = e[z - 0] - e[z - 4];
    let y0 = e[z - 0] + e[z - 4];
    let y2 = e[z - 2] + e[z - 6];
    let k22 = e[z - 2] - e[z - 6];

    e[z - 0] = y0 + y2;
    e[z - 2] = y0 - y2;

    let k33 = e[z - 3] - e[z - 7];

    e[z - 4] = k00 + k33;
    e[z - 6] = k00 - k33;

    let k11 = e[z - 1] - e[z - 5];
    let y1 = e[z - 1] + e[z - 5];
    let y3 = e[z - 3] + e[z - 7];

    e[z - 1] = y1 + y3;
    e[z - 3] = y1 - y3;
    e[z - 5] = k11 - k22;
    e[z - 7] = k11 + k22;
}

fn step3_inner_s_loop_ld654(n: usize, e: &mut [f32], i_off: usize, a: &[f32], base_n: usize) {
    let a_off = base_n >> 3;
    let a2 = a[a_off];

    let mut z = i_off as isize;
    let base = z - 16 * n as isize;

    while z > base {
        let zz = z as usize;

        let k00 = e[zz - 0] - e[zz - 8];
        let k11 = e[zz - 1] - e[zz - 9];
        e[zz - 0] += e[zz - 8];
        e[zz - 1] += e[zz - 9];
        e[zz - 8] = k00;
        e[zz - 9] = k11;

        let k00 = e[zz - 2] - e[zz - 10];
        let k11 = e[zz - 3] - e[zz - 11];
        e[zz - 2] += e[zz - 10];
        e[zz - 3] += e[zz - 11];
        e[zz - 10] = (k00 + k11) * a2;
        e[zz - 11] = (k11 - k00) * a2;

        // Operands reversed to avoid a unary negation.
        let k00 = e[zz - 12] - e[zz - 4];
        let k11 = e[zz - 5] - e[zz - 13];
        e[zz - 4] += e[zz - 12];
        e[zz - 5] += e[zz - 13];
        e[zz - 12] = k11;
        e[zz - 13] = k00;

        // Operands reversed to avoid a unary negation.
        let k00 = e[zz - 14] - e[zz - 6];
        let k11 = e[zz - 7] - e[zz - 15];
        e[zz - 6] += e[zz - 14];
        e[zz - 7] += e[zz - 15];
        e[zz - 14] = (k00 + k11) * a2;
        e[zz - 15] = (k00 - k11) * a2;

        iter_54(e, zz);
        iter_54(e, zz - 8);

        z -= 16;
    }
}

#[cfg(test)]
mod tests {
    use super::Imdct;
    use std::f64::consts::PI;

    /// The direct summation form of the transform computed by `Imdct`.
    fn imdct_slow(spectrum: &[f32], out: &mut [f32]) {
        let n = out.len();
        let n2 = spectrum.len();
        assert_eq!(n, 2 * n2);

        for (i, item) in out.iter_mut().enumerate() {
            let mut accum = 0.0f64;

            for (j, &x) in spectrum.iter().enumerate() {
                let angle =
                    PI / 2.0 / n as f64 * (2.0 * i as f64 + 1.0 + n as f64 / 2.0)
                        * (2.0 * j as f64 + 1.0);
                accum += f64::from(x) * angle.cos();
            }

            *item = accum as f32;
        }
    }

    /// Generate a deterministic pseudo-random spectrum in [-1, 1).
    fn generate_spectrum(len: usize) -> Vec<f32> {
        let mut lcg: u32 = 0x2545f491;

        (0..len)
            .map(|_| {
                lcg = lcg.wrapping_mul(1664525).wrapping_add(1013904223);
                ((lcg >> 8) as f32 / 8_388_608.0) - 1.0
            })
            .collect()
    }

    fn verify_imdct_for_len(n: usize) {
        let spectrum = generate_spectrum(n / 2);

        let mut expected = vec![0.0f32; n];
        imdct_slow(&spectrum, &mut expected);

        let mut actual = vec![0.0f32; n];
        actual[..n / 2].copy_from_slice(&spectrum);

        let mut imdct = Imdct::new(n);
        imdct.imdct(&mut actual);

        for (&a, &e) in actual.iter().zip(&expected) {
            let delta = f64::from(a) - f64::from(e);
            assert!(
                delta.abs() < 1e-3 * (1.0 + f64::from(e).abs()),
                "delta {} too large (actual {}, expected {})",
                delta,
                a,
                e
            );
        }
    }

    #[test]
    fn verify_imdct_64() {
        verify_imdct_for_len(64);
    }

    #[test]
    fn verify_imdct_256() {
        verify_imdct_for_len(256);
    }

    #[test]
    fn verify_imdct_2048() {
        verify_imdct_for_len(2048);
    }
}
