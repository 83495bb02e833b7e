// --- Файл: src/data/transforms.rs ---

//! Преобразования изображений для предобработки и аугментации.
//!
//! Все стадии работают с тензорами формы `[C, H, W]` и значениями в `[0, 1]`
//! (кроме [`Normalize`], которая обычно стоит последней).

use crate::error::{DataError, Result};
use image::RgbImage;
use ndarray::{s, Array3, ArrayD, Ix3};
use rand::seq::IndexedRandom;
use rand::Rng;

/// Трейт для преобразований данных.
pub trait Transform: Send + Sync {
    /// Применяет преобразование к тензору изображения.
    fn apply(&self, data: ArrayD<f32>) -> Result<ArrayD<f32>>;

    /// Имя стадии.
    fn name(&self) -> &'static str;

    /// Имена всех стадий, включая вложенные.
    fn stage_names(&self) -> Vec<&'static str> {
        vec![self.name()]
    }
}

/// Переводит RGB-изображение `[H, W, 3]` (u8) в тензор `[3, H, W]` (f32, 0..1).
pub fn to_tensor(image: &RgbImage) -> ArrayD<f32> {
    let (width, height) = image.dimensions();
    Array3::from_shape_fn((3, height as usize, width as usize), |(c, y, x)| {
        image.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
    })
    .into_dyn()
}

fn into_chw(data: ArrayD<f32>) -> Result<Array3<f32>> {
    let shape = data.shape().to_vec();
    data.into_dimensionality::<Ix3>()
        .map_err(|_| DataError::NotAnImage(shape))
}

/// Композиция нескольких преобразований.
pub struct Compose {
    transforms: Vec<Box<dyn Transform>>,
}

impl Compose {
    /// Создает пустую композицию.
    pub fn new() -> Self {
        Self {
            transforms: Vec::new(),
        }
    }

    /// Добавляет преобразование в композицию.
    pub fn add<T: Transform + 'static>(mut self, transform: T) -> Self {
        self.transforms.push(Box::new(transform));
        self
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }
}

impl Default for Compose {
    fn default() -> Self {
        Self::new()
    }
}

impl Transform for Compose {
    fn apply(&self, mut data: ArrayD<f32>) -> Result<ArrayD<f32>> {
        for transform in &self.transforms {
            data = transform.apply(data)?;
        }
        Ok(data)
    }

    fn name(&self) -> &'static str {
        "Compose"
    }

    fn stage_names(&self) -> Vec<&'static str> {
        self.transforms.iter().flat_map(|t| t.stage_names()).collect()
    }
}

/// Билинейно масштабирует окно `[top..top+height, left..left+width]` в `out_h x out_w`.
fn resized_crop(
    img: &Array3<f32>,
    top: usize,
    left: usize,
    height: usize,
    width: usize,
    out_h: usize,
    out_w: usize,
) -> Array3<f32> {
    let channels = img.shape()[0];
    let scale_y = height as f32 / out_h as f32;
    let scale_x = width as f32 / out_w as f32;
    let max_y = (height - 1) as f32;
    let max_x = (width - 1) as f32;

    Array3::from_shape_fn((channels, out_h, out_w), |(c, y, x)| {
        let sy = ((y as f32 + 0.5) * scale_y - 0.5).clamp(0.0, max_y);
        let sx = ((x as f32 + 0.5) * scale_x - 0.5).clamp(0.0, max_x);
        let y0 = sy.floor() as usize;
        let x0 = sx.floor() as usize;
        let y1 = (y0 + 1).min(height - 1);
        let x1 = (x0 + 1).min(width - 1);
        let dy = sy - y0 as f32;
        let dx = sx - x0 as f32;

        let p = |yy: usize, xx: usize| img[[c, top + yy, left + xx]];
        p(y0, x0) * (1.0 - dx) * (1.0 - dy)
            + p(y0, x1) * dx * (1.0 - dy)
            + p(y1, x0) * (1.0 - dx) * dy
            + p(y1, x1) * dx * dy
    })
}

fn image_hw(img: &Array3<f32>) -> Result<(usize, usize)> {
    let (_, h, w) = img.dim();
    if h == 0 || w == 0 {
        return Err(DataError::NotAnImage(img.shape().to_vec()));
    }
    Ok((h, w))
}

/// Детерминированное изменение размера до `(height, width)`.
pub struct Resize {
    height: usize,
    width: usize,
}

impl Resize {
    pub fn new(height: usize, width: usize) -> Self {
        Self { height, width }
    }

    pub fn square(size: usize) -> Self {
        Self::new(size, size)
    }
}

impl Transform for Resize {
    fn apply(&self, data: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let img = into_chw(data)?;
        let (h, w) = image_hw(&img)?;
        Ok(resized_crop(&img, 0, 0, h, w, self.height, self.width).into_dyn())
    }

    fn name(&self) -> &'static str {
        "Resize"
    }
}

/// Случайный кроп по площади и пропорциям с последующим масштабированием.
pub struct RandomResizedCrop {
    height: usize,
    width: usize,
    scale: (f32, f32),
    ratio: (f32, f32),
}

impl RandomResizedCrop {
    /// Кроп со стандартными пропорциями `3/4 .. 4/3`.
    pub fn new(height: usize, width: usize, scale: (f32, f32)) -> Self {
        Self {
            height,
            width,
            scale,
            ratio: (3.0 / 4.0, 4.0 / 3.0),
        }
    }

    /// Возвращает окно `(top, left, height, width)` внутри изображения `h x w`.
    fn params<R: Rng + ?Sized>(
        &self,
        h: usize,
        w: usize,
        rng: &mut R,
    ) -> (usize, usize, usize, usize) {
        let area = (h * w) as f32;
        let log_ratio = (self.ratio.0.ln(), self.ratio.1.ln());

        for _ in 0..10 {
            let target_area = area * rng.random_range(self.scale.0..=self.scale.1);
            let aspect = rng.random_range(log_ratio.0..=log_ratio.1).exp();
            let cw = (target_area * aspect).sqrt().round() as usize;
            let ch = (target_area / aspect).sqrt().round() as usize;

            if cw > 0 && cw <= w && ch > 0 && ch <= h {
                let top = rng.random_range(0..=h - ch);
                let left = rng.random_range(0..=w - cw);
                return (top, left, ch, cw);
            }
        }

        // Центральный кроп с ограничением пропорций
        let in_ratio = w as f32 / h as f32;
        let (ch, cw) = if in_ratio < self.ratio.0 {
            ((w as f32 / self.ratio.0).round() as usize, w)
        } else if in_ratio > self.ratio.1 {
            (h, (h as f32 * self.ratio.1).round() as usize)
        } else {
            (h, w)
        };
        let ch = ch.clamp(1, h);
        let cw = cw.clamp(1, w);
        ((h - ch) / 2, (w - cw) / 2, ch, cw)
    }
}

impl Transform for RandomResizedCrop {
    fn apply(&self, data: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let img = into_chw(data)?;
        let (h, w) = image_hw(&img)?;
        let (top, left, ch, cw) = self.params(h, w, &mut rand::rng());
        Ok(resized_crop(&img, top, left, ch, cw, self.height, self.width).into_dyn())
    }

    fn name(&self) -> &'static str {
        "RandomResizedCrop"
    }
}

/// Нормализация по каналам: `(x - mean[c]) / std[c]`.
pub struct Normalize {
    mean: Vec<f32>,
    std: Vec<f32>,
}

impl Normalize {
    /// Создает нормализатор с поканальными параметрами.
    pub fn new(mean: Vec<f32>, std: Vec<f32>) -> Self {
        Self { mean, std }
    }

    /// Одинаковые параметры для всех каналов.
    pub fn from_scalars(mean: f32, std: f32) -> Self {
        Self::new(vec![mean], vec![std])
    }

    fn channel_param(values: &[f32], c: usize) -> f32 {
        if values.len() == 1 {
            values[0]
        } else {
            values[c]
        }
    }
}

impl Transform for Normalize {
    fn apply(&self, data: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let mut img = into_chw(data)?;
        let channels = img.shape()[0];
        for (len, what) in [(self.mean.len(), "mean"), (self.std.len(), "std")] {
            if len != 1 && len != channels {
                return Err(DataError::Config(format!(
                    "Normalize {what} has {len} values for {channels} channels"
                )));
            }
        }

        for (c, mut plane) in img.outer_iter_mut().enumerate() {
            let mean = Self::channel_param(&self.mean, c);
            let std = Self::channel_param(&self.std, c);
            plane.mapv_inplace(|x| (x - mean) / std);
        }
        Ok(img.into_dyn())
    }

    fn name(&self) -> &'static str {
        "Normalize"
    }
}

/// Горизонтальное отражение с вероятностью `p`.
pub struct RandomHorizontalFlip {
    p: f64,
}

impl RandomHorizontalFlip {
    pub fn new(p: f64) -> Self {
        Self { p }
    }
}

impl Transform for RandomHorizontalFlip {
    fn apply(&self, data: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let img = into_chw(data)?;
        if !rand::rng().random_bool(self.p) {
            return Ok(img.into_dyn());
        }
        Ok(img
            .slice(s![.., .., ..;-1])
            .as_standard_layout()
            .into_owned()
            .into_dyn())
    }

    fn name(&self) -> &'static str {
        "RandomHorizontalFlip"
    }
}

/// Применяет вложенное преобразование с вероятностью `p`.
pub struct RandomApply {
    inner: Box<dyn Transform>,
    p: f64,
}

impl RandomApply {
    pub fn new<T: Transform + 'static>(inner: T, p: f64) -> Self {
        Self {
            inner: Box::new(inner),
            p,
        }
    }
}

impl Transform for RandomApply {
    fn apply(&self, data: ArrayD<f32>) -> Result<ArrayD<f32>> {
        if rand::rng().random_bool(self.p) {
            self.inner.apply(data)
        } else {
            Ok(data)
        }
    }

    fn name(&self) -> &'static str {
        "RandomApply"
    }

    fn stage_names(&self) -> Vec<&'static str> {
        let mut names = vec![self.name()];
        names.extend(self.inner.stage_names());
        names
    }
}

/// Равновероятно выбирает одно из преобразований.
pub struct RandomChoice {
    options: Vec<Box<dyn Transform>>,
}

impl RandomChoice {
    pub fn new(options: Vec<Box<dyn Transform>>) -> Self {
        Self { options }
    }
}

impl Transform for RandomChoice {
    fn apply(&self, data: ArrayD<f32>) -> Result<ArrayD<f32>> {
        match self.options.choose(&mut rand::rng()) {
            Some(transform) => transform.apply(data),
            None => Ok(data),
        }
    }

    fn name(&self) -> &'static str {
        "RandomChoice"
    }

    fn stage_names(&self) -> Vec<&'static str> {
        let mut names = vec![self.name()];
        names.extend(self.options.iter().flat_map(|t| t.stage_names()));
        names
    }
}

/// Аффинное преобразование вокруг центра: поворот (в градусах, против часовой
/// стрелки), сдвиг в пикселях и масштаб. Ближайший сосед, пустые пиксели = 0.
fn warp_affine(
    img: &Array3<f32>,
    angle_deg: f32,
    translate: (f32, f32),
    scale: f32,
) -> Array3<f32> {
    let (channels, h, w) = img.dim();
    let cx = (w as f32 - 1.0) * 0.5;
    let cy = (h as f32 - 1.0) * 0.5;
    let (sin, cos) = angle_deg.to_radians().sin_cos();

    let mut out = Array3::zeros((channels, h, w));
    for y in 0..h {
        for x in 0..w {
            let dx = (x as f32 - cx - translate.0) / scale;
            let dy = (y as f32 - cy - translate.1) / scale;
            let sx = (cos * dx - sin * dy + cx).round();
            let sy = (sin * dx + cos * dy + cy).round();
            if sx < 0.0 || sy < 0.0 || sx >= w as f32 || sy >= h as f32 {
                continue;
            }
            for c in 0..channels {
                out[[c, y, x]] = img[[c, sy as usize, sx as usize]];
            }
        }
    }
    out
}

/// Случайный поворот, сдвиг и масштаб.
pub struct RandomAffine {
    degrees: f32,
    translate: (f32, f32),
    scale: (f32, f32),
}

impl RandomAffine {
    /// `translate` задается долями ширины и высоты.
    pub fn new(degrees: f32, translate: (f32, f32), scale: (f32, f32)) -> Self {
        Self {
            degrees,
            translate,
            scale,
        }
    }
}

impl Transform for RandomAffine {
    fn apply(&self, data: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let img = into_chw(data)?;
        let (h, w) = image_hw(&img)?;
        let mut rng = rand::rng();

        let angle = rng.random_range(-self.degrees..=self.degrees);
        let max_dx = self.translate.0 * w as f32;
        let max_dy = self.translate.1 * h as f32;
        let tx = rng.random_range(-max_dx..=max_dx).round();
        let ty = rng.random_range(-max_dy..=max_dy).round();
        let scale = rng.random_range(self.scale.0..=self.scale.1);

        Ok(warp_affine(&img, angle, (tx, ty), scale).into_dyn())
    }

    fn name(&self) -> &'static str {
        "RandomAffine"
    }
}

/// Случайный поворот на угол из `[-degrees, degrees]`.
pub struct RandomRotation {
    degrees: f32,
}

impl RandomRotation {
    pub fn new(degrees: f32) -> Self {
        Self { degrees }
    }
}

impl Transform for RandomRotation {
    fn apply(&self, data: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let img = into_chw(data)?;
        image_hw(&img)?;
        let angle = rand::rng().random_range(-self.degrees..=self.degrees);
        Ok(warp_affine(&img, angle, (0.0, 0.0), 1.0).into_dyn())
    }

    fn name(&self) -> &'static str {
        "RandomRotation"
    }
}

/// Повышение резкости: смешивание с размытой копией. Граница не меняется.
pub struct RandomAdjustSharpness {
    factor: f32,
    p: f64,
}

impl RandomAdjustSharpness {
    pub fn new(factor: f32, p: f64) -> Self {
        Self { factor, p }
    }
}

fn adjust_sharpness(img: &Array3<f32>, factor: f32) -> Array3<f32> {
    let (channels, h, w) = img.dim();
    let mut out = img.clone();
    if h < 3 || w < 3 {
        return out;
    }
    for c in 0..channels {
        for y in 1..h - 1 {
            for x in 1..w - 1 {
                let mut sum = 0.0;
                for ky in 0..3 {
                    for kx in 0..3 {
                        let weight = if ky == 1 && kx == 1 { 5.0 } else { 1.0 };
                        sum += weight * img[[c, y + ky - 1, x + kx - 1]];
                    }
                }
                let degenerate = sum / 13.0;
                let orig = img[[c, y, x]];
                out[[c, y, x]] = (factor * orig + (1.0 - factor) * degenerate).clamp(0.0, 1.0);
            }
        }
    }
    out
}

impl Transform for RandomAdjustSharpness {
    fn apply(&self, data: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let img = into_chw(data)?;
        if !rand::rng().random_bool(self.p) {
            return Ok(img.into_dyn());
        }
        Ok(adjust_sharpness(&img, self.factor).into_dyn())
    }

    fn name(&self) -> &'static str {
        "RandomAdjustSharpness"
    }
}

/// Гауссово размытие с ядром `(kernel_x, kernel_y)` и случайной сигмой.
pub struct GaussianBlur {
    kernel: (usize, usize),
    sigma: (f32, f32),
}

impl GaussianBlur {
    pub fn new(kernel: (usize, usize), sigma: (f32, f32)) -> Self {
        Self { kernel, sigma }
    }
}

fn gaussian_kernel(size: usize, sigma: f32) -> Vec<f32> {
    let half = (size as f32 - 1.0) * 0.5;
    let raw: Vec<f32> = (0..size)
        .map(|i| {
            let x = i as f32 - half;
            (-(x * x) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let total: f32 = raw.iter().sum();
    raw.into_iter().map(|v| v / total).collect()
}

fn reflect(i: isize, n: usize) -> usize {
    let last = n as isize - 1;
    if last <= 0 {
        return 0;
    }
    let r = if i < 0 {
        -i
    } else if i > last {
        2 * last - i
    } else {
        i
    };
    r.clamp(0, last) as usize
}

fn gaussian_blur(img: &Array3<f32>, kx: &[f32], ky: &[f32]) -> Array3<f32> {
    let (channels, h, w) = img.dim();
    let rx = (kx.len() / 2) as isize;
    let ry = (ky.len() / 2) as isize;

    let horizontal = Array3::from_shape_fn((channels, h, w), |(c, y, x)| {
        kx.iter()
            .enumerate()
            .map(|(k, wt)| wt * img[[c, y, reflect(x as isize + k as isize - rx, w)]])
            .sum::<f32>()
    });
    Array3::from_shape_fn((channels, h, w), |(c, y, x)| {
        ky.iter()
            .enumerate()
            .map(|(k, wt)| wt * horizontal[[c, reflect(y as isize + k as isize - ry, h), x]])
            .sum::<f32>()
    })
}

impl Transform for GaussianBlur {
    fn apply(&self, data: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let img = into_chw(data)?;
        let sigma = rand::rng().random_range(self.sigma.0..=self.sigma.1);
        let kx = gaussian_kernel(self.kernel.0, sigma);
        let ky = gaussian_kernel(self.kernel.1, sigma);
        Ok(gaussian_blur(&img, &kx, &ky).into_dyn())
    }

    fn name(&self) -> &'static str {
        "GaussianBlur"
    }
}

/// Растягивает диапазон каждого канала до `[0, 1]` с вероятностью `p`.
pub struct RandomAutocontrast {
    p: f64,
}

impl RandomAutocontrast {
    pub fn new(p: f64) -> Self {
        Self { p }
    }
}

impl Transform for RandomAutocontrast {
    fn apply(&self, data: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let mut img = into_chw(data)?;
        if !rand::rng().random_bool(self.p) {
            return Ok(img.into_dyn());
        }
        for mut plane in img.outer_iter_mut() {
            let min = plane.iter().cloned().fold(f32::INFINITY, f32::min);
            let max = plane.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            let range = max - min;
            if range > 1e-8 {
                plane.mapv_inplace(|x| ((x - min) / range).clamp(0.0, 1.0));
            }
        }
        Ok(img.into_dyn())
    }

    fn name(&self) -> &'static str {
        "RandomAutocontrast"
    }
}

/// Случайная яркость (множитель из `[1-b, 1+b]`) и сдвиг тона (из `[-h, h]`).
pub struct ColorJitter {
    brightness: f32,
    hue: f32,
}

impl ColorJitter {
    pub fn new(brightness: f32, hue: f32) -> Self {
        Self { brightness, hue }
    }
}

fn rgb_to_hsv(r: f32, g: f32, b: f32) -> (f32, f32, f32) {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;
    let s = if max > 0.0 { delta / max } else { 0.0 };
    let h = if delta <= 0.0 {
        0.0
    } else if max == r {
        ((g - b) / delta).rem_euclid(6.0) / 6.0
    } else if max == g {
        ((b - r) / delta + 2.0) / 6.0
    } else {
        ((r - g) / delta + 4.0) / 6.0
    };
    (h, s, max)
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> (f32, f32, f32) {
    let h6 = h.rem_euclid(1.0) * 6.0;
    let sector = h6.floor();
    let f = h6 - sector;
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));
    match sector as u32 % 6 {
        0 => (v, t, p),
        1 => (q, v, p),
        2 => (p, v, t),
        3 => (p, q, v),
        4 => (t, p, v),
        _ => (v, p, q),
    }
}

fn shift_hue(img: &mut Array3<f32>, shift: f32) {
    let (_, h, w) = img.dim();
    for y in 0..h {
        for x in 0..w {
            let (hue, sat, val) = rgb_to_hsv(img[[0, y, x]], img[[1, y, x]], img[[2, y, x]]);
            let (r, g, b) = hsv_to_rgb(hue + shift, sat, val);
            img[[0, y, x]] = r;
            img[[1, y, x]] = g;
            img[[2, y, x]] = b;
        }
    }
}

impl Transform for ColorJitter {
    fn apply(&self, data: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let mut img = into_chw(data)?;
        let mut rng = rand::rng();
        let factor = rng.random_range((1.0 - self.brightness).max(0.0)..=1.0 + self.brightness);
        let shift = rng.random_range(-self.hue..=self.hue);
        let hue_first = img.shape()[0] == 3 && rng.random_bool(0.5);

        if hue_first {
            shift_hue(&mut img, shift);
        }
        img.mapv_inplace(|x| (x * factor).clamp(0.0, 1.0));
        if img.shape()[0] == 3 && !hue_first {
            shift_hue(&mut img, shift);
        }
        Ok(img.into_dyn())
    }

    fn name(&self) -> &'static str {
        "ColorJitter"
    }
}
