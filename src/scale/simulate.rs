use rand::Rng;

/// Number of readings in one simulated burst.
pub const SIMULATED_BURST: usize = 6;
/// Maximum distance of a fluctuating reading from its base.
pub const FLUCTUATION: f64 = 0.05;

/// Generates one burst of plausible readings: five values fluctuating around a
/// random base, then the stable base itself.
pub fn generate_simulated_weights() -> Vec<f64> {
    generate_with(&mut rand::thread_rng())
}

pub fn generate_with<R: Rng + ?Sized>(rng: &mut R) -> Vec<f64> {
    let base: f64 = rng.gen_range(1.0..30.0);
    let mut weights = Vec::with_capacity(SIMULATED_BURST);

    for _ in 0..SIMULATED_BURST - 1 {
        let variation = base + rng.gen_range(-FLUCTUATION..FLUCTUATION);
        weights.push(truncate_cents(variation));
    }
    weights.push(truncate_cents(base));
    weights
}

fn truncate_cents(value: f64) -> f64 {
    (value * 100.0).trunc() / 100.0
}
