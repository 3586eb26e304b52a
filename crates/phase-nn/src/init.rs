//! Deterministic parameter initialization.
//!
//! Every learned tensor is generated on the host from a seeded
//! [`SimpleRng`] and registered in a [`VarMap`] under a dotted name, so the
//! same seed always produces the same model and an external optimizer can
//! reach every parameter through `VarMap::all_vars`.

use candle_core::{Device, Tensor, Var};
use candle_nn::{Conv1d, Conv1dConfig, Linear, VarMap};
use phase_core::PhaseError;

use crate::map_candle;

/// Deterministic PRNG based on splitmix64.
///
/// Candle's CPU `rand`/`randn` cannot be seeded, so every initial weight is
/// drawn here instead: the same [`ModelConfig::seed`](phase_core::ModelConfig)
/// rebuilds the same model on any device. [`SimpleRng::next_normal`] feeds
/// the Gram-Schmidt orthogonal init, which candle's `Init` does not offer.
///
/// # Example
///
/// ```
/// use phase_nn::init::SimpleRng;
///
/// // One Xavier bound for a 9 -> 56 projection, drawn twice from one seed.
/// let bound = (6.0f32 / 65.0).sqrt();
/// let draw = |seed| {
///     let mut rng = SimpleRng::new(seed);
///     (0..4).map(|_| rng.next_f32_range(-bound, bound)).collect::<Vec<_>>()
/// };
/// assert_eq!(draw(42), draw(42));
/// assert!(draw(42).iter().all(|w| w.abs() <= bound));
/// ```
#[derive(Debug, Clone)]
pub struct SimpleRng(u64);

impl SimpleRng {
    /// Starts the stream at `seed`.
    pub fn new(seed: u64) -> Self {
        Self(seed)
    }

    /// Advances the state and returns the mixed output.
    pub fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9e3779b97f4a7c15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
        z ^ (z >> 31)
    }

    /// Returns a uniform f32 in [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u64() >> 40) as f32 / ((1u64 << 24) as f32)
    }

    /// Returns a uniform f64 in [0, 1).
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / ((1u64 << 53) as f64)
    }

    /// Returns a uniform f32 in [lo, hi).
    pub fn next_f32_range(&mut self, lo: f32, hi: f32) -> f32 {
        lo + (hi - lo) * self.next_f32()
    }

    /// Returns a standard normal sample (Box–Muller).
    pub fn next_normal(&mut self) -> f64 {
        let u1 = 1.0 - self.next_f64();
        let u2 = self.next_f64();
        (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
    }
}

/// Creates and registers named parameters.
///
/// # Example
///
/// ```
/// use candle_core::Device;
/// use candle_nn::VarMap;
/// use phase_nn::init::ParamBuilder;
///
/// let var_map = VarMap::new();
/// let device = Device::Cpu;
/// let mut params = ParamBuilder::new(&var_map, &device, 7);
/// let _layer = params.xavier_linear("proj", 4, 3).unwrap();
/// assert_eq!(var_map.all_vars().len(), 2);
/// ```
pub struct ParamBuilder<'a> {
    var_map: &'a VarMap,
    device: &'a Device,
    rng: SimpleRng,
}

impl<'a> ParamBuilder<'a> {
    /// Creates a builder that registers into `var_map` on `device`.
    pub fn new(var_map: &'a VarMap, device: &'a Device, seed: u64) -> Self {
        Self {
            var_map,
            device,
            rng: SimpleRng::new(seed),
        }
    }

    /// The device parameters are created on.
    pub fn device(&self) -> &Device {
        self.device
    }

    /// Linear layer with Xavier-uniform weights and zero bias.
    pub fn xavier_linear(&mut self, name: &str, in_dim: usize, out_dim: usize) -> Result<Linear, PhaseError> {
        let bound = (6.0 / (in_dim + out_dim) as f32).sqrt();
        let weight = self.uniform(&format!("{name}.weight"), &[out_dim, in_dim], bound)?;
        let bias = self.zeros(&format!("{name}.bias"), out_dim)?;
        Ok(Linear::new(weight, Some(bias)))
    }

    /// Linear layer with an orthogonal weight matrix and zero bias.
    pub fn orthogonal_linear(
        &mut self,
        name: &str,
        in_dim: usize,
        out_dim: usize,
    ) -> Result<Linear, PhaseError> {
        let values = self.orthogonal(out_dim, in_dim);
        let weight = self.register(
            &format!("{name}.weight"),
            Tensor::from_vec(values, (out_dim, in_dim), self.device),
        )?;
        let bias = self.zeros(&format!("{name}.bias"), out_dim)?;
        Ok(Linear::new(weight, Some(bias)))
    }

    /// Linear layer with weights and bias uniform in `±1/√in_dim`.
    pub fn linear(&mut self, name: &str, in_dim: usize, out_dim: usize) -> Result<Linear, PhaseError> {
        let bound = 1.0 / (in_dim as f32).sqrt();
        let weight = self.uniform(&format!("{name}.weight"), &[out_dim, in_dim], bound)?;
        let bias = self.uniform(&format!("{name}.bias"), &[out_dim], bound)?;
        Ok(Linear::new(weight, Some(bias)))
    }

    /// Linear layer with weights and bias uniform in `±bound`.
    pub fn uniform_linear(
        &mut self,
        name: &str,
        in_dim: usize,
        out_dim: usize,
        bound: f32,
    ) -> Result<Linear, PhaseError> {
        let weight = self.uniform(&format!("{name}.weight"), &[out_dim, in_dim], bound)?;
        let bias = self.uniform(&format!("{name}.bias"), &[out_dim], bound)?;
        Ok(Linear::new(weight, Some(bias)))
    }

    /// 1-D convolution `[out, in, kernel]`, uniform in `±1/√(in·kernel)`.
    pub fn conv1d(
        &mut self,
        name: &str,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
    ) -> Result<Conv1d, PhaseError> {
        let bound = 1.0 / ((in_channels * kernel) as f32).sqrt();
        let weight = self.uniform(
            &format!("{name}.weight"),
            &[out_channels, in_channels, kernel],
            bound,
        )?;
        let bias = self.uniform(&format!("{name}.bias"), &[out_channels], bound)?;
        Ok(Conv1d::new(weight, Some(bias), Conv1dConfig::default()))
    }

    fn uniform(&mut self, name: &str, shape: &[usize], bound: f32) -> Result<Tensor, PhaseError> {
        let count: usize = shape.iter().product();
        let values: Vec<f32> = (0..count)
            .map(|_| self.rng.next_f32_range(-bound, bound))
            .collect();
        self.register(name, Tensor::from_vec(values, shape, self.device))
    }

    fn zeros(&mut self, name: &str, len: usize) -> Result<Tensor, PhaseError> {
        self.register(name, Tensor::from_vec(vec![0.0f32; len], len, self.device))
    }

    /// Row-major `[rows, cols]` matrix with orthonormal rows or columns,
    /// whichever is the shorter side.
    fn orthogonal(&mut self, rows: usize, cols: usize) -> Vec<f32> {
        let tall = rows.max(cols);
        let short = rows.min(cols);
        let mut basis: Vec<Vec<f64>> = Vec::with_capacity(short);
        while basis.len() < short {
            let mut v: Vec<f64> = (0..tall).map(|_| self.rng.next_normal()).collect();
            // Two Gram-Schmidt passes keep the basis orthogonal in f64.
            for _ in 0..2 {
                for q in &basis {
                    let dot: f64 = v.iter().zip(q).map(|(a, b)| a * b).sum();
                    for (vi, qi) in v.iter_mut().zip(q) {
                        *vi -= dot * qi;
                    }
                }
            }
            let norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
            if norm < 1e-8 {
                continue;
            }
            v.iter_mut().for_each(|x| *x /= norm);
            basis.push(v);
        }

        let mut out = vec![0.0f32; rows * cols];
        for r in 0..rows {
            for c in 0..cols {
                out[r * cols + c] = if rows >= cols {
                    basis[c][r] as f32
                } else {
                    basis[r][c] as f32
                };
            }
        }
        out
    }

    fn register(
        &mut self,
        name: &str,
        tensor: candle_core::Result<Tensor>,
    ) -> Result<Tensor, PhaseError> {
        let tensor = tensor.map_err(map_candle("param init"))?;
        let var = Var::from_tensor(&tensor).map_err(map_candle("param init"))?;
        let mut vars = self.var_map.data().lock().map_err(|_| PhaseError::Internal {
            message: "parameter map lock poisoned".to_string(),
        })?;
        if vars.contains_key(name) {
            return Err(PhaseError::Internal {
                message: format!("parameter `{name}` registered twice"),
            });
        }
        let value = var.as_tensor().clone();
        vars.insert(name.to_string(), var);
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeds_select_distinct_streams() {
        let a: Vec<u64> = {
            let mut rng = SimpleRng::new(42);
            (0..16).map(|_| rng.next_u64()).collect()
        };
        let replay: Vec<u64> = {
            let mut rng = SimpleRng::new(42);
            (0..16).map(|_| rng.next_u64()).collect()
        };
        let other: Vec<u64> = {
            let mut rng = SimpleRng::new(43);
            (0..16).map(|_| rng.next_u64()).collect()
        };
        assert_eq!(a, replay);
        assert_ne!(a, other);
    }

    #[test]
    fn normal_samples_are_centered() {
        let mut rng = SimpleRng::new(9);
        let n = 20_000;
        let samples: Vec<f64> = (0..n).map(|_| rng.next_normal()).collect();
        let mean = samples.iter().sum::<f64>() / n as f64;
        let var = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64;
        assert!(mean.abs() < 0.05, "mean {mean}");
        assert!((var - 1.0).abs() < 0.1, "variance {var}");
    }

    #[test]
    fn rng_ranges_hold() {
        let mut rng = SimpleRng::new(3);
        for _ in 0..1000 {
            let v = rng.next_f32_range(-0.5, 0.5);
            assert!((-0.5..0.5).contains(&v));
            assert!((0.0..1.0).contains(&rng.next_f64()));
            assert!(rng.next_normal().is_finite());
        }
    }

    fn gram(values: &[f32], rows: usize, cols: usize, by_rows: bool) -> Vec<f32> {
        let n = if by_rows { rows } else { cols };
        let len = if by_rows { cols } else { rows };
        let at = |i: usize, k: usize| {
            if by_rows {
                values[i * cols + k]
            } else {
                values[k * cols + i]
            }
        };
        let mut g = vec![0.0f32; n * n];
        for i in 0..n {
            for j in 0..n {
                g[i * n + j] = (0..len).map(|k| at(i, k) * at(j, k)).sum();
            }
        }
        g
    }

    #[test]
    fn orthogonal_tall_matrix_has_orthonormal_columns() {
        let var_map = VarMap::new();
        let device = Device::Cpu;
        let mut params = ParamBuilder::new(&var_map, &device, 1);
        let m = params.orthogonal(10, 4);
        let g = gram(&m, 10, 4, false);
        for i in 0..4 {
            for j in 0..4 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((g[i * 4 + j] - expected).abs() < 1e-5, "g[{i},{j}]={}", g[i * 4 + j]);
            }
        }
    }

    #[test]
    fn orthogonal_wide_matrix_has_orthonormal_rows() {
        let var_map = VarMap::new();
        let device = Device::Cpu;
        let mut params = ParamBuilder::new(&var_map, &device, 2);
        let m = params.orthogonal(3, 7);
        let g = gram(&m, 3, 7, true);
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((g[i * 3 + j] - expected).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn xavier_weights_within_bound_and_bias_zero() {
        let var_map = VarMap::new();
        let device = Device::Cpu;
        let mut params = ParamBuilder::new(&var_map, &device, 5);
        let layer = params.xavier_linear("k", 9, 16).unwrap();
        let bound = (6.0f32 / 25.0).sqrt();
        let w = layer.weight().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(w.iter().all(|x| x.abs() <= bound));
        let b = layer.bias().unwrap().to_vec1::<f32>().unwrap();
        assert!(b.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn duplicate_names_rejected() {
        let var_map = VarMap::new();
        let device = Device::Cpu;
        let mut params = ParamBuilder::new(&var_map, &device, 5);
        params.linear("dup", 2, 2).unwrap();
        assert!(matches!(
            params.linear("dup", 2, 2),
            Err(PhaseError::Internal { .. })
        ));
    }

    #[test]
    fn same_seed_same_parameters() {
        let device = Device::Cpu;
        let (a, b) = (VarMap::new(), VarMap::new());
        let la = ParamBuilder::new(&a, &device, 11).conv1d("c", 3, 3, 2).unwrap();
        let lb = ParamBuilder::new(&b, &device, 11).conv1d("c", 3, 3, 2).unwrap();
        let wa = la.weight().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let wb = lb.weight().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(wa, wb);
    }
}
