use anyhow::{Result, bail};
use rand::Rng;

/// Picks the model for a run: one independent uniform draw per request from a
/// configured pool. The pool is injected, never global, so tests can pin the
/// draw with a single-element pool.
pub struct ModelSelector {
    pool: Vec<String>,
}

impl ModelSelector {
    pub fn new(pool: Vec<String>) -> Result<Self> {
        if pool.is_empty() {
            bail!("model pool is empty; configure at least one model");
        }
        Ok(Self { pool })
    }

    pub fn draw(&self) -> &str {
        let idx = rand::thread_rng().gen_range(0..self.pool.len());
        &self.pool[idx]
    }
}
