//! Image transformation and augmentation pipeline.
//!
//! Every sample goes through the same fixed-shape chain: float RGB, resize, centre
//! crop, then (when augmentation is on) random perspective, random rotation and a
//! Gaussian blur. The output is always `3 x crop_h x crop_w`.

use image::imageops::FilterType;
use image::{DynamicImage, Rgb, Rgb32FImage};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformPipeline {
    /// Intermediate (width, height) every image is resized to.
    pub resize: (u32, u32),
    /// Final (width, height) taken from the centre of the resized image.
    pub crop: (u32, u32),
    /// Master switch for the randomised steps.
    pub augment: bool,
    pub perspective_prob: f32,
    /// Fraction of the half-width/half-height each corner may move inward.
    pub distortion_scale: f32,
    /// Rotation angle range in degrees (counter-clockwise).
    pub rotation_degrees: (f32, f32),
    /// Blur kernel (width, height); both odd.
    pub blur_kernel: (usize, usize),
    pub blur_sigma: (f32, f32),
}

impl Default for TransformPipeline {
    fn default() -> Self {
        Self {
            resize: (256, 256),
            crop: (224, 224),
            augment: true,
            perspective_prob: 1.0,
            distortion_scale: 0.6,
            rotation_degrees: (0.0, 180.0),
            blur_kernel: (5, 9),
            blur_sigma: (0.1, 5.0),
        }
    }
}

impl TransformPipeline {
    /// Same geometry, no randomised steps.
    pub fn deterministic(&self) -> Self {
        Self {
            augment: false,
            ..self.clone()
        }
    }

    /// Output shape as `[channels, height, width]`.
    pub fn output_shape(&self) -> [usize; 3] {
        [3, self.crop.1 as usize, self.crop.0 as usize]
    }

    pub fn describe(&self) -> String {
        if !self.augment {
            return format!(
                "resize={}x{} crop={}x{} augment=off",
                self.resize.0, self.resize.1, self.crop.0, self.crop.1
            );
        }
        format!(
            "resize={}x{} crop={}x{} perspective_p={:.2} distortion={:.2} \
             rotation=[{:.0},{:.0}] blur_kernel={}x{} blur_sigma=[{:.2},{:.2}]",
            self.resize.0,
            self.resize.1,
            self.crop.0,
            self.crop.1,
            self.perspective_prob,
            self.distortion_scale,
            self.rotation_degrees.0,
            self.rotation_degrees.1,
            self.blur_kernel.0,
            self.blur_kernel.1,
            self.blur_sigma.0,
            self.blur_sigma.1,
        )
    }

    /// Transform a decoded image into CHW floats. Returns `(data, width, height)`.
    pub fn apply(&self, img: DynamicImage, rng: &mut dyn rand::RngCore) -> (Vec<f32>, u32, u32) {
        let img = img.to_rgb32f();
        let (rw, rh) = self.resize;
        let img = image::imageops::resize(&img, rw.max(1), rh.max(1), FilterType::Triangle);
        let mut img = center_crop(&img, self.crop.0.max(1), self.crop.1.max(1));

        if self.augment {
            maybe_perspective(&mut img, self.perspective_prob, self.distortion_scale, rng);
            maybe_rotate(&mut img, self.rotation_degrees, rng);
            maybe_gaussian_blur(&mut img, self.blur_kernel, self.blur_sigma, rng);
        }

        let (w, h) = img.dimensions();
        (to_chw(&img), w, h)
    }
}

#[derive(Debug, Clone)]
pub struct TransformPipelineBuilder {
    inner: TransformPipeline,
}

impl Default for TransformPipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TransformPipelineBuilder {
    pub fn new() -> Self {
        Self {
            inner: TransformPipeline::default(),
        }
    }
    pub fn resize(mut self, size: (u32, u32)) -> Self {
        self.inner.resize = size;
        self
    }
    pub fn crop(mut self, size: (u32, u32)) -> Self {
        self.inner.crop = size;
        self
    }
    pub fn augment(mut self, on: bool) -> Self {
        self.inner.augment = on;
        self
    }
    pub fn perspective(mut self, prob: f32, distortion_scale: f32) -> Self {
        self.inner.perspective_prob = prob;
        self.inner.distortion_scale = distortion_scale;
        self
    }
    pub fn rotation(mut self, min_deg: f32, max_deg: f32) -> Self {
        self.inner.rotation_degrees = (min_deg.min(max_deg), min_deg.max(max_deg));
        self
    }
    /// Even kernel sizes are bumped to the next odd size.
    pub fn blur(mut self, kernel: (usize, usize), sigma: (f32, f32)) -> Self {
        self.inner.blur_kernel = (kernel.0 | 1, kernel.1 | 1);
        self.inner.blur_sigma = (sigma.0.min(sigma.1), sigma.0.max(sigma.1));
        self
    }
    pub fn build(self) -> TransformPipeline {
        self.inner
    }
}

fn center_crop(img: &Rgb32FImage, crop_w: u32, crop_h: u32) -> Rgb32FImage {
    let (w, h) = img.dimensions();
    let left = ((w as f32 - crop_w as f32) / 2.0).round() as i64;
    let top = ((h as f32 - crop_h as f32) / 2.0).round() as i64;
    if left >= 0 && top >= 0 {
        return image::imageops::crop_imm(img, left as u32, top as u32, crop_w, crop_h).to_image();
    }
    // Crop larger than the image: centre it on a zero canvas.
    let mut canvas = Rgb32FImage::new(crop_w, crop_h);
    image::imageops::replace(&mut canvas, img, -left, -top);
    canvas
}

fn to_chw(img: &Rgb32FImage) -> Vec<f32> {
    let (w, h) = img.dimensions();
    let plane = (w * h) as usize;
    let mut out = vec![0.0f32; plane * 3];
    for (x, y, pixel) in img.enumerate_pixels() {
        let base = (y * w + x) as usize;
        out[base] = pixel[0];
        out[plane + base] = pixel[1];
        out[2 * plane + base] = pixel[2];
    }
    out
}

fn bilinear(img: &Rgb32FImage, x: f32, y: f32) -> Option<Rgb<f32>> {
    let (w, h) = img.dimensions();
    if x < 0.0 || y < 0.0 || x > (w - 1) as f32 || y > (h - 1) as f32 {
        return None;
    }
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;
    let p00 = img.get_pixel(x0, y0);
    let p10 = img.get_pixel(x1, y0);
    let p01 = img.get_pixel(x0, y1);
    let p11 = img.get_pixel(x1, y1);
    let mut out = [0.0f32; 3];
    for (c, v) in out.iter_mut().enumerate() {
        let top = p00[c] * (1.0 - fx) + p10[c] * fx;
        let bottom = p01[c] * (1.0 - fx) + p11[c] * fx;
        *v = top * (1.0 - fy) + bottom * fy;
    }
    Some(Rgb(out))
}

/// Solve the 8-parameter homography mapping each `from[i]` onto `to[i]`.
pub(crate) fn perspective_coeffs(from: &[[f32; 2]; 4], to: &[[f32; 2]; 4]) -> Option<[f64; 8]> {
    let mut a = [[0.0f64; 9]; 8];
    for i in 0..4 {
        let (x, y) = (from[i][0] as f64, from[i][1] as f64);
        let (u, v) = (to[i][0] as f64, to[i][1] as f64);
        a[2 * i] = [x, y, 1.0, 0.0, 0.0, 0.0, -u * x, -u * y, u];
        a[2 * i + 1] = [0.0, 0.0, 0.0, x, y, 1.0, -v * x, -v * y, v];
    }
    // Gaussian elimination with partial pivoting on the augmented matrix.
    for col in 0..8 {
        let pivot = (col..8).max_by(|&r1, &r2| {
            a[r1][col]
                .abs()
                .partial_cmp(&a[r2][col].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        if a[pivot][col].abs() < 1e-12 {
            return None;
        }
        a.swap(col, pivot);
        for row in 0..8 {
            if row == col {
                continue;
            }
            let factor = a[row][col] / a[col][col];
            if factor == 0.0 {
                continue;
            }
            for k in col..9 {
                a[row][k] -= factor * a[col][k];
            }
        }
    }
    let mut out = [0.0f64; 8];
    for (i, v) in out.iter_mut().enumerate() {
        *v = a[i][8] / a[i][i];
    }
    Some(out)
}

fn inward(rng: &mut dyn rand::RngCore, d: u32) -> f32 {
    rng.random_range(0..=d) as f32
}

fn outward(rng: &mut dyn rand::RngCore, size: u32, d: u32) -> f32 {
    rng.random_range(size.saturating_sub(d + 1)..size) as f32
}

pub(crate) fn maybe_perspective(
    img: &mut Rgb32FImage,
    prob: f32,
    distortion_scale: f32,
    rng: &mut dyn rand::RngCore,
) {
    if prob <= 0.0 || distortion_scale <= 0.0 {
        return;
    }
    if rng.random_range(0.0..1.0) >= prob {
        return;
    }
    let (w, h) = img.dimensions();
    if w < 2 || h < 2 {
        return;
    }
    let dx = (distortion_scale * (w / 2) as f32) as u32;
    let dy = (distortion_scale * (h / 2) as f32) as u32;
    let end = [
        [inward(rng, dx), inward(rng, dy)],
        [outward(rng, w, dx), inward(rng, dy)],
        [outward(rng, w, dx), outward(rng, h, dy)],
        [inward(rng, dx), outward(rng, h, dy)],
    ];
    let start = [
        [0.0, 0.0],
        [(w - 1) as f32, 0.0],
        [(w - 1) as f32, (h - 1) as f32],
        [0.0, (h - 1) as f32],
    ];
    // Output pixels live in the displaced corners; sample back into the source.
    let Some(c) = perspective_coeffs(&end, &start) else {
        return;
    };
    let src = img.clone();
    for (x, y, pixel) in img.enumerate_pixels_mut() {
        let (xf, yf) = (x as f64, y as f64);
        let denom = c[6] * xf + c[7] * yf + 1.0;
        if denom.abs() < 1e-12 {
            *pixel = Rgb([0.0; 3]);
            continue;
        }
        let sx = (c[0] * xf + c[1] * yf + c[2]) / denom;
        let sy = (c[3] * xf + c[4] * yf + c[5]) / denom;
        *pixel = bilinear(&src, sx as f32, sy as f32).unwrap_or(Rgb([0.0; 3]));
    }
}

pub(crate) fn maybe_rotate(
    img: &mut Rgb32FImage,
    degrees: (f32, f32),
    rng: &mut dyn rand::RngCore,
) {
    let (lo, hi) = degrees;
    if lo == 0.0 && hi == 0.0 {
        return;
    }
    let angle = if hi > lo {
        rng.random_range(lo..=hi)
    } else {
        lo
    };
    rotate_about_center(img, angle);
}

/// Rotate counter-clockwise by `angle` degrees, nearest neighbour, zero fill.
pub(crate) fn rotate_about_center(img: &mut Rgb32FImage, angle: f32) {
    let (w, h) = img.dimensions();
    let theta = angle.to_radians();
    let (sin, cos) = theta.sin_cos();
    let cx = (w as f32 - 1.0) / 2.0;
    let cy = (h as f32 - 1.0) / 2.0;
    let src = img.clone();
    for (x, y, pixel) in img.enumerate_pixels_mut() {
        let dx = x as f32 - cx;
        let dy = y as f32 - cy;
        let sx = (cx + dx * cos - dy * sin).round();
        let sy = (cy + dx * sin + dy * cos).round();
        *pixel = if sx >= 0.0 && sy >= 0.0 && sx < w as f32 && sy < h as f32 {
            *src.get_pixel(sx as u32, sy as u32)
        } else {
            Rgb([0.0; 3])
        };
    }
}

pub(crate) fn gaussian_kernel(size: usize, sigma: f32) -> Vec<f32> {
    let size = size.max(1);
    let half = (size / 2) as f32;
    let mut k: Vec<f32> = (0..size)
        .map(|i| {
            let x = (i as f32 - half) / sigma;
            (-0.5 * x * x).exp()
        })
        .collect();
    let sum: f32 = k.iter().sum();
    for v in k.iter_mut() {
        *v /= sum;
    }
    k
}

fn reflect(i: i64, n: u32) -> u32 {
    let n = n as i64;
    if n == 1 {
        return 0;
    }
    let mut i = i;
    while i < 0 || i >= n {
        if i < 0 {
            i = -i;
        }
        if i >= n {
            i = 2 * (n - 1) - i;
        }
    }
    i as u32
}

pub(crate) fn maybe_gaussian_blur(
    img: &mut Rgb32FImage,
    kernel: (usize, usize),
    sigma: (f32, f32),
    rng: &mut dyn rand::RngCore,
) {
    let (lo, hi) = sigma;
    if hi <= 0.0 || (kernel.0 <= 1 && kernel.1 <= 1) {
        return;
    }
    let s = if hi > lo {
        rng.random_range(lo.max(1e-3).min(hi)..=hi)
    } else {
        hi
    };
    let kx = gaussian_kernel(kernel.0, s);
    let ky = gaussian_kernel(kernel.1, s);
    let (w, h) = img.dimensions();

    // Separable pass: horizontal then vertical, reflect padding.
    let mut tmp = Rgb32FImage::new(w, h);
    let rx = (kx.len() / 2) as i64;
    for y in 0..h {
        for x in 0..w {
            let mut acc = [0.0f32; 3];
            for (i, kv) in kx.iter().enumerate() {
                let sx = reflect(x as i64 + i as i64 - rx, w);
                let p = img.get_pixel(sx, y);
                for c in 0..3 {
                    acc[c] += p[c] * kv;
                }
            }
            tmp.put_pixel(x, y, Rgb(acc));
        }
    }
    let ry = (ky.len() / 2) as i64;
    for y in 0..h {
        for x in 0..w {
            let mut acc = [0.0f32; 3];
            for (i, kv) in ky.iter().enumerate() {
                let sy = reflect(y as i64 + i as i64 - ry, h);
                let p = tmp.get_pixel(x, sy);
                for c in 0..3 {
                    acc[c] += p[c] * kv;
                }
            }
            img.put_pixel(x, y, Rgb(acc));
        }
    }
}
