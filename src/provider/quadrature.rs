use lazy_static::lazy_static;
use std::f64::consts::PI;

/// Upper bound of Newton iterations used to find Gauss-Legendre nodes
pub const MAX_NEWTON_ITERATIONS: usize = 100;

/// Number of nodes of the one-dimensional rules used by the occultation integrals
pub const OCCULTATION_NODES: usize = 48;

lazy_static! {
    static ref OCCULTATION_RULE: GaussLegendre = GaussLegendre::new(OCCULTATION_NODES);
}

/// Gauss-Legendre quadrature rule on `[-1, 1]`
#[derive(Clone, Debug)]
pub struct GaussLegendre {
    pub nodes: Vec<f64>,
    pub weights: Vec<f64>,
}

impl GaussLegendre {
    pub fn new(n: usize) -> Self {
        let mut nodes = vec![0.0; n];
        let mut weights = vec![0.0; n];
        for i in 0..n.div_ceil(2) {
            let mut x = f64::cos(PI * (i as f64 + 0.75) / (n as f64 + 0.5));
            let mut dp = 1.0;
            for _ in 0..MAX_NEWTON_ITERATIONS {
                let (p, p_prev) = legendre_pair(n, x);
                dp = n as f64 * (x * p - p_prev) / (x * x - 1.0);
                let dx = p / dp;
                x -= dx;
                if dx.abs() < 1e-15 {
                    break;
                }
            }
            // derivative at the converged node
            let (p, p_prev) = legendre_pair(n, x);
            if x * x != 1.0 {
                dp = n as f64 * (x * p - p_prev) / (x * x - 1.0);
            }
            let w = 2.0 / ((1.0 - x * x) * dp * dp);
            nodes[i] = -x;
            nodes[n - 1 - i] = x;
            weights[i] = w;
            weights[n - 1 - i] = w;
        }
        Self { nodes, weights }
    }

    /// Shared rule of the occultation integrals
    pub fn occultation() -> &'static Self {
        &OCCULTATION_RULE
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes and weights mapped onto `[a, b]`
    pub fn mapped(&self, a: f64, b: f64) -> impl Iterator<Item = (f64, f64)> + '_ {
        let half = 0.5 * (b - a);
        let mid = 0.5 * (a + b);
        self.nodes
            .iter()
            .zip(self.weights.iter())
            .map(move |(&x, &w)| (mid + half * x, half * w))
    }
}

/// `(P_n(x), P_{n-1}(x))`
fn legendre_pair(n: usize, x: f64) -> (f64, f64) {
    let mut p = 1.0;
    let mut p_prev = 0.0;
    for j in 1..=n {
        let p_prev2 = p_prev;
        p_prev = p;
        p = ((2 * j - 1) as f64 * x * p_prev - (j - 1) as f64 * p_prev2) / j as f64;
    }
    (p, p_prev)
}

/// Product rule on the unit sphere, exact for polynomials of degree `2 * lmax`
///
/// Gauss-Legendre in `z` times the uniform rule in the azimuth. Weights sum to `4π`.
#[derive(Clone, Debug)]
pub struct SphereGrid {
    pub points: Vec<[f64; 3]>,
    pub weights: Vec<f64>,
}

impl SphereGrid {
    pub fn new(lmax: usize) -> Self {
        let rule = GaussLegendre::new(lmax + 1);
        let n_phi = 2 * lmax + 2;
        let d_phi = 2.0 * PI / n_phi as f64;
        let mut points = Vec::with_capacity(rule.len() * n_phi);
        let mut weights = Vec::with_capacity(rule.len() * n_phi);
        for (&z, &w) in rule.nodes.iter().zip(rule.weights.iter()) {
            let rho = f64::sqrt(1.0 - z * z);
            for k in 0..n_phi {
                let phi = (k as f64 + 0.5) * d_phi;
                points.push([rho * phi.cos(), rho * phi.sin(), z]);
                weights.push(w * d_phi);
            }
        }
        Self { points, weights }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[f64; 3], f64)> {
        self.points.iter().zip(self.weights.iter().copied())
    }
}
