use burn::config::Config;
use rand::Rng;

/// Random geometric augmentation applied to training images.
#[derive(Config, Debug)]
pub struct AugmentationConfig {
    /// Shear angle range, in degrees. The angle is drawn from `[-range, range]`.
    #[config(default = 0.2)]
    pub shear_range: f64,
    /// Zoom range. Row and column factors are drawn independently from
    /// `[1 - range, 1 + range]`.
    #[config(default = 0.2)]
    pub zoom_range: f64,
}

/// 2D point transformation on homogeneous `[x, y, 1]` column vectors.
///
/// Maps an output pixel to the source location it is resampled from.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Transform2D {
    transform: [[f32; 3]; 3],
}

impl Transform2D {
    /// Makes an identity transform (x = Ax)
    pub fn identity() -> Self {
        Self {
            transform: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
        }
    }

    /// Scaling by `sx` along x and `sy` along y around `(cx, cy)`.
    pub fn scale(sx: f32, sy: f32, cx: f32, cy: f32) -> Self {
        Self {
            transform: [
                [sx, 0.0, cx - sx * cx],
                [0.0, sy, cy - sy * cy],
                [0.0, 0.0, 1.0],
            ],
        }
    }

    /// Shear by `theta` radians around `(cx, cy)`: x is scaled by `cos(theta)`
    /// and y is offset by `-sin(theta) * x`.
    pub fn shear(theta: f32, cx: f32, cy: f32) -> Self {
        let cos_theta = theta.cos();
        let sin_theta = theta.sin();

        Self {
            transform: [
                [cos_theta, 0.0, cx - cos_theta * cx],
                [-sin_theta, 1.0, cy + sin_theta * cx],
                [0.0, 0.0, 1.0],
            ],
        }
    }

    /// Apply a transform to another transform: multiplying the transforms
    pub fn mul(&self, other: Transform2D) -> Transform2D {
        let mut result = [[0.0f32; 3]; 3];

        for (i, row) in result.iter_mut().enumerate() {
            for (j, value) in row.iter_mut().enumerate() {
                *value = self.transform[i][0] * other.transform[0][j]
                    + self.transform[i][1] * other.transform[1][j]
                    + self.transform[i][2] * other.transform[2][j];
            }
        }

        Transform2D { transform: result }
    }

    /// Transformed location of `(x, y)`.
    pub fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        let [a, b, c] = self.transform;
        let w = c[0] * x + c[1] * y + c[2];

        (
            (a[0] * x + a[1] * y + a[2]) / w,
            (b[0] * x + b[1] * y + b[2]) / w,
        )
    }

    /// Resamples an HWC image: every output pixel takes the bilinear sample
    /// at its transformed location. Locations outside the source take the
    /// value of the closest edge pixel.
    pub fn resample(
        &self,
        pixels: &[f32],
        height: usize,
        width: usize,
        channels: usize,
    ) -> Vec<f32> {
        debug_assert_eq!(pixels.len(), height * width * channels);

        let mut output = vec![0.0; pixels.len()];
        for row in 0..height {
            for col in 0..width {
                let (x, y) = self.apply(col as f32, row as f32);
                let offset = (row * width + col) * channels;
                sample_bilinear(
                    pixels,
                    [height, width, channels],
                    y,
                    x,
                    &mut output[offset..offset + channels],
                );
            }
        }

        output
    }
}

/// One concrete shear/zoom draw.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AffineTransform {
    /// Shear angle in radians.
    pub shear: f32,
    pub zoom_rows: f32,
    pub zoom_cols: f32,
}

impl AffineTransform {
    pub const IDENTITY: Self = Self {
        shear: 0.0,
        zoom_rows: 1.0,
        zoom_cols: 1.0,
    };

    /// Draws a transform from the configured ranges.
    pub fn sample<R: Rng + ?Sized>(config: &AugmentationConfig, rng: &mut R) -> Self {
        let shear = if config.shear_range > 0.0 {
            rng.random_range(-config.shear_range..=config.shear_range)
        } else {
            0.0
        };

        let (zoom_rows, zoom_cols) = if config.zoom_range > 0.0 {
            let range = (1.0 - config.zoom_range)..=(1.0 + config.zoom_range);
            (rng.random_range(range.clone()), rng.random_range(range))
        } else {
            (1.0, 1.0)
        };

        Self {
            shear: shear.to_radians() as f32,
            zoom_rows: zoom_rows as f32,
            zoom_cols: zoom_cols as f32,
        }
    }

    /// Shear after zoom, both around the image centre.
    pub fn matrix(&self, height: usize, width: usize) -> Transform2D {
        let cx = width as f32 / 2.0 - 0.5;
        let cy = height as f32 / 2.0 - 0.5;

        let zoom = Transform2D::scale(self.zoom_cols, self.zoom_rows, cx, cy);
        Transform2D::shear(self.shear, cx, cy).mul(zoom)
    }

    /// Applies the transform to an HWC image.
    pub fn apply(&self, pixels: &[f32], height: usize, width: usize, channels: usize) -> Vec<f32> {
        if *self == Self::IDENTITY {
            return pixels.to_vec();
        }

        self.matrix(height, width).resample(pixels, height, width, channels)
    }
}

fn sample_bilinear(pixels: &[f32], dims: [usize; 3], row: f32, col: f32, out: &mut [f32]) {
    let [height, width, channels] = dims;
    let row = row.clamp(0.0, (height - 1) as f32);
    let col = col.clamp(0.0, (width - 1) as f32);

    let r0 = row.floor() as usize;
    let c0 = col.floor() as usize;
    let r1 = (r0 + 1).min(height - 1);
    let c1 = (c0 + 1).min(width - 1);
    let fr = row - r0 as f32;
    let fc = col - c0 as f32;

    let at = |r: usize, c: usize, k: usize| pixels[(r * width + c) * channels + k];

    for (k, value) in out.iter_mut().enumerate() {
        let top = at(r0, c0, k) * (1.0 - fc) + at(r0, c1, k) * fc;
        let bottom = at(r1, c0, k) * (1.0 - fc) + at(r1, c1, k) * fc;
        *value = top * (1.0 - fr) + bottom * fr;
    }
}
