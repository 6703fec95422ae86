use std::collections::{HashMap, VecDeque};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::token::LlamaToken;

/// Seed value requesting the engine default.
pub const LLAMA_DEFAULT_SEED: u32 = 0xFFFF_FFFF;

/// Per-request sampling configuration.
///
/// Defaults follow the conventional llama.cpp sampling parameters.
#[derive(Debug, Clone)]
pub struct SamplingParams {
    /// Number of previous tokens remembered for penalties.
    pub n_prev: usize,
    /// Number of candidate probabilities reported per sampled token
    /// (0 = disabled).
    pub n_probs: usize,
    /// Top-K cutoff (<= 0 = disabled).
    pub top_k: i32,
    /// Top-P (nucleus) cutoff (1.0 = disabled).
    pub top_p: f32,
    /// Tail-free sampling z (1.0 = disabled).
    pub tfs_z: f32,
    /// Locally typical sampling p (1.0 = disabled).
    pub typical_p: f32,
    /// Temperature (<= 0 selects greedy sampling).
    pub temp: f32,
    /// Window of last tokens to penalize (< 0 = whole remembered window).
    pub penalty_last_n: i32,
    /// Repetition penalty (1.0 = disabled).
    pub penalty_repeat: f32,
    /// Frequency penalty (0.0 = disabled).
    pub penalty_freq: f32,
    /// Presence penalty (0.0 = disabled).
    pub penalty_present: f32,
    /// Mirostat mode (0 = disabled, 1 = v1, 2 = v2).
    pub mirostat: i32,
    /// Mirostat target entropy.
    pub mirostat_tau: f32,
    /// Mirostat learning rate.
    pub mirostat_eta: f32,
    /// Whether the newline token is subject to penalties.
    pub penalize_nl: bool,
    /// RNG seed.
    pub seed: u32,
    /// Grammar definition carried with the request; constrained decoding is
    /// an engine concern and the string is only recorded here.
    pub grammar: String,
    /// Additive per-token logit bias; `-inf` forbids a token.
    pub logit_bias: HashMap<LlamaToken, f32>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            n_prev: 64,
            n_probs: 0,
            top_k: 40,
            top_p: 0.95,
            tfs_z: 1.0,
            typical_p: 1.0,
            temp: 0.8,
            penalty_last_n: 64,
            penalty_repeat: 1.1,
            penalty_freq: 0.0,
            penalty_present: 0.0,
            mirostat: 0,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            penalize_nl: true,
            seed: LLAMA_DEFAULT_SEED,
            grammar: String::new(),
            logit_bias: HashMap::new(),
        }
    }
}

/// One sampling candidate after the chain has run.
#[derive(Debug, Clone, Copy)]
pub struct TokenData {
    pub id: LlamaToken,
    pub logit: f32,
    pub p: f32,
}

/// Per-slot sampling state.
///
/// Holds the remembered token window for penalties, the mirostat surprise
/// state and the seeded RNG.  Recreated for every new prompt; feed it tokens
/// with [`SamplerChain::accept`] and draw from logits with
/// [`SamplerChain::sample`].
pub struct SamplerChain {
    params: SamplingParams,
    prev: VecDeque<LlamaToken>,
    cur: Vec<TokenData>,
    mirostat_mu: f32,
    rng: StdRng,
}

impl SamplerChain {
    pub fn new(params: SamplingParams) -> Self {
        let mirostat_mu = 2.0 * params.mirostat_tau;
        let rng = StdRng::seed_from_u64(params.seed as u64);
        Self {
            params,
            prev: VecDeque::new(),
            cur: Vec::new(),
            mirostat_mu,
            rng,
        }
    }

    pub fn params(&self) -> &SamplingParams {
        &self.params
    }

    /// Clear remembered tokens and mirostat state.
    pub fn reset(&mut self) {
        self.prev.clear();
        self.cur.clear();
        self.mirostat_mu = 2.0 * self.params.mirostat_tau;
    }

    /// Remember an accepted token.
    ///
    /// `apply_grammar` is false during prompt ingestion and true for sampled
    /// tokens; grammar advancement is an engine concern, the flag only keeps
    /// the call sites explicit about the distinction.
    pub fn accept(&mut self, token: LlamaToken, apply_grammar: bool) {
        let _ = apply_grammar;
        if self.params.n_prev == 0 {
            return;
        }
        if self.prev.len() == self.params.n_prev {
            self.prev.pop_front();
        }
        self.prev.push_back(token);
    }

    /// Candidates left after the last [`SamplerChain::sample`] call, sorted
    /// by probability.
    pub fn candidates(&self) -> &[TokenData] {
        &self.cur
    }

    /// Sample the next token from a logits row.
    ///
    /// `nl_token` identifies the newline token so `penalize_nl = false` can
    /// exempt it from the repetition penalties.
    pub fn sample(&mut self, logits: &[f32], nl_token: LlamaToken) -> LlamaToken {
        let mut cur: Vec<TokenData> = logits
            .iter()
            .enumerate()
            .map(|(id, &logit)| TokenData {
                id: id as LlamaToken,
                logit,
                p: 0.0,
            })
            .collect();

        for (&token, &bias) in &self.params.logit_bias {
            if let Some(data) = cur.get_mut(token.max(0) as usize) {
                data.logit += bias;
            }
        }

        self.apply_penalties(&mut cur, nl_token);

        let min_keep = self.params.n_probs.max(1);
        let temp = self.params.temp;

        let id = if temp <= 0.0 {
            sort_by_logit(&mut cur);
            // greedy still normalizes so n_probs candidates carry probabilities
            softmax(&mut cur);
            cur[0].id
        } else if self.params.mirostat == 1 {
            apply_temp(&mut cur, temp);
            self.sample_mirostat_v1(&mut cur)
        } else if self.params.mirostat == 2 {
            apply_temp(&mut cur, temp);
            self.sample_mirostat_v2(&mut cur)
        } else {
            top_k(&mut cur, self.params.top_k, min_keep);
            tail_free(&mut cur, self.params.tfs_z, min_keep);
            typical(&mut cur, self.params.typical_p, min_keep);
            top_p(&mut cur, self.params.top_p, min_keep);
            apply_temp(&mut cur, temp);
            softmax(&mut cur);
            self.sample_dist(&cur)
        };

        self.cur = cur;
        id
    }

    fn apply_penalties(&self, cur: &mut [TokenData], nl_token: LlamaToken) {
        let params = &self.params;
        let window = if params.penalty_last_n < 0 {
            self.prev.len()
        } else {
            (params.penalty_last_n as usize).min(self.prev.len())
        };
        let active = params.penalty_repeat != 1.0
            || params.penalty_freq != 0.0
            || params.penalty_present != 0.0;
        if window == 0 || !active {
            return;
        }

        let nl_logit = cur.get(nl_token.max(0) as usize).map(|d| d.logit);

        let mut counts: HashMap<LlamaToken, u32> = HashMap::new();
        for &token in self.prev.iter().rev().take(window) {
            *counts.entry(token).or_insert(0) += 1;
        }

        for (&token, &count) in &counts {
            let Some(data) = cur.get_mut(token.max(0) as usize) else {
                continue;
            };
            if data.logit <= 0.0 {
                data.logit *= params.penalty_repeat;
            } else {
                data.logit /= params.penalty_repeat;
            }
            data.logit -= count as f32 * params.penalty_freq + params.penalty_present;
        }

        if !params.penalize_nl {
            if let (Some(logit), Some(data)) = (nl_logit, cur.get_mut(nl_token.max(0) as usize)) {
                data.logit = logit;
            }
        }
    }

    fn sample_dist(&mut self, cur: &[TokenData]) -> LlamaToken {
        let r: f32 = self.rng.gen();
        let mut acc = 0.0;
        for data in cur {
            acc += data.p;
            if r < acc {
                return data.id;
            }
        }
        cur[cur.len() - 1].id
    }

    fn sample_mirostat_v1(&mut self, cur: &mut Vec<TokenData>) -> LlamaToken {
        let tau = self.params.mirostat_tau;
        let eta = self.params.mirostat_eta;
        let n_vocab = cur.len() as f32;
        const M: usize = 100;

        softmax(cur);

        // estimate the Zipf exponent from the head of the distribution
        let n = M.min(cur.len().saturating_sub(1));
        let (mut sum_ti_bi, mut sum_ti_sq) = (0.0f32, 0.0f32);
        for i in 0..n {
            let t_i = ((i + 2) as f32 / (i + 1) as f32).ln();
            let b_i = (cur[i].p / cur[i + 1].p).ln();
            sum_ti_bi += t_i * b_i;
            sum_ti_sq += t_i * t_i;
        }
        let s_hat = if sum_ti_sq > 0.0 { sum_ti_bi / sum_ti_sq } else { 1.0 };

        let epsilon_hat = s_hat - 1.0;
        let k = if epsilon_hat.abs() < f32::EPSILON {
            cur.len()
        } else {
            let k = ((epsilon_hat * self.mirostat_mu.exp2())
                / (1.0 - n_vocab.powf(-epsilon_hat)))
            .powf(1.0 / s_hat);
            (k.round() as usize).clamp(1, cur.len())
        };

        cur.truncate(k);
        softmax(cur);
        let id = self.sample_dist(cur);

        let p = cur.iter().find(|d| d.id == id).map(|d| d.p).unwrap_or(f32::MIN_POSITIVE);
        let surprise = -p.log2();
        self.mirostat_mu -= eta * (surprise - tau);
        id
    }

    fn sample_mirostat_v2(&mut self, cur: &mut Vec<TokenData>) -> LlamaToken {
        let tau = self.params.mirostat_tau;
        let eta = self.params.mirostat_eta;

        softmax(cur);
        let mu = self.mirostat_mu;
        let keep = cur.iter().take_while(|d| -d.p.log2() <= mu).count().max(1);
        cur.truncate(keep);
        softmax(cur);
        let id = self.sample_dist(cur);

        let p = cur.iter().find(|d| d.id == id).map(|d| d.p).unwrap_or(f32::MIN_POSITIVE);
        let surprise = -p.log2();
        self.mirostat_mu -= eta * (surprise - tau);
        id
    }
}

// ── Candidate transforms ───────────────────────────────────────────────────────

fn sort_by_logit(cur: &mut [TokenData]) {
    cur.sort_unstable_by(|a, b| b.logit.total_cmp(&a.logit));
}

/// Normalize candidate probabilities; leaves the slice sorted by logit.
fn softmax(cur: &mut [TokenData]) {
    sort_by_logit(cur);
    let max_logit = cur[0].logit;
    let mut sum = 0.0f32;
    for data in cur.iter_mut() {
        data.p = (data.logit - max_logit).exp();
        sum += data.p;
    }
    for data in cur.iter_mut() {
        data.p /= sum;
    }
}

fn top_k(cur: &mut Vec<TokenData>, k: i32, min_keep: usize) {
    if k <= 0 {
        return;
    }
    sort_by_logit(cur);
    let keep = (k as usize).max(min_keep).min(cur.len());
    cur.truncate(keep);
}

fn top_p(cur: &mut Vec<TokenData>, p: f32, min_keep: usize) {
    if p >= 1.0 {
        return;
    }
    softmax(cur);
    let mut acc = 0.0;
    let mut keep = cur.len();
    for (i, data) in cur.iter().enumerate() {
        acc += data.p;
        if acc >= p && i + 1 >= min_keep {
            keep = i + 1;
            break;
        }
    }
    cur.truncate(keep);
}

fn tail_free(cur: &mut Vec<TokenData>, z: f32, min_keep: usize) {
    if z >= 1.0 || cur.len() <= 2 {
        return;
    }
    softmax(cur);

    let first_derivatives: Vec<f32> = cur.windows(2).map(|w| w[0].p - w[1].p).collect();
    let mut second_derivatives: Vec<f32> = first_derivatives
        .windows(2)
        .map(|w| (w[0] - w[1]).abs())
        .collect();
    let sum: f32 = second_derivatives.iter().sum();
    if sum > 1e-6 {
        for d in second_derivatives.iter_mut() {
            *d /= sum;
        }
    } else {
        let uniform = 1.0 / second_derivatives.len() as f32;
        for d in second_derivatives.iter_mut() {
            *d = uniform;
        }
    }

    let mut acc = 0.0;
    let mut keep = cur.len();
    for (i, &d) in second_derivatives.iter().enumerate() {
        acc += d;
        if acc > z && i >= min_keep {
            keep = i;
            break;
        }
    }
    cur.truncate(keep.max(min_keep).min(cur.len()));
}

fn typical(cur: &mut Vec<TokenData>, p: f32, min_keep: usize) {
    if p >= 1.0 {
        return;
    }
    softmax(cur);

    let entropy: f32 = cur
        .iter()
        .filter(|d| d.p > 0.0)
        .map(|d| -d.p * d.p.ln())
        .sum();

    let mut shifted: Vec<(f32, TokenData)> = cur
        .iter()
        .map(|&d| {
            let surprise = if d.p > 0.0 { -d.p.ln() } else { f32::INFINITY };
            ((surprise - entropy).abs(), d)
        })
        .collect();
    shifted.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut acc = 0.0;
    let mut keep = shifted.len();
    for (i, (_, data)) in shifted.iter().enumerate() {
        acc += data.p;
        if acc >= p && i + 1 >= min_keep {
            keep = i + 1;
            break;
        }
    }

    *cur = shifted.into_iter().take(keep).map(|(_, d)| d).collect();
}

fn apply_temp(cur: &mut [TokenData], temp: f32) {
    for data in cur.iter_mut() {
        data.logit /= temp;
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;

    fn greedy_params() -> SamplingParams {
        SamplingParams {
            temp: 0.0,
            penalty_repeat: 1.0,
            penalty_last_n: 0,
            ..SamplingParams::default()
        }
    }

    #[test]
    fn greedy_picks_argmax() {
        let mut chain = SamplerChain::new(greedy_params());
        let logits = vec![0.1, 3.0, -1.0, 2.9];
        assert_eq!(chain.sample(&logits, 0), 1);
    }

    #[test]
    fn greedy_candidates_are_normalized() {
        let mut chain = SamplerChain::new(SamplingParams {
            n_probs: 3,
            ..greedy_params()
        });
        chain.sample(&[1.0, 2.0, 3.0], 0);
        let total: f32 = chain.candidates().iter().map(|d| d.p).sum();
        assert!((total - 1.0).abs() < 1e-5);
        assert_eq!(chain.candidates()[0].id, 2);
    }

    #[test]
    fn logit_bias_forbids_token() {
        let mut params = greedy_params();
        params.logit_bias.insert(1, f32::NEG_INFINITY);
        let mut chain = SamplerChain::new(params);
        assert_eq!(chain.sample(&[0.5, 10.0, 0.6], 0), 2);
    }

    #[test]
    fn repeat_penalty_discourages_recent_tokens() {
        let params = SamplingParams {
            temp: 0.0,
            penalty_repeat: 2.0,
            penalty_last_n: 8,
            ..SamplingParams::default()
        };
        let mut chain = SamplerChain::new(params);
        chain.accept(1, true);
        // token 1 leads before the penalty, loses after it
        assert_eq!(chain.sample(&[1.9, 2.0, 0.0], 0), 0);
    }

    #[test]
    fn penalize_nl_false_restores_newline_logit() {
        let params = SamplingParams {
            temp: 0.0,
            penalty_repeat: 10.0,
            penalty_last_n: 8,
            penalize_nl: false,
            ..SamplingParams::default()
        };
        let mut chain = SamplerChain::new(params);
        chain.accept(1, true);
        // token 1 is the newline here, so its logit survives the penalty
        assert_eq!(chain.sample(&[1.9, 2.0, 0.0], 1), 1);
    }

    #[test]
    fn seeded_sampling_is_deterministic() {
        let params = SamplingParams {
            temp: 0.9,
            seed: 7,
            ..SamplingParams::default()
        };
        let logits = vec![0.2, 0.8, 0.5, 0.4];
        let a: Vec<_> = {
            let mut chain = SamplerChain::new(params.clone());
            (0..8).map(|_| chain.sample(&logits, 0)).collect()
        };
        let b: Vec<_> = {
            let mut chain = SamplerChain::new(params);
            (0..8).map(|_| chain.sample(&logits, 0)).collect()
        };
        assert_eq!(a, b);
    }

    #[test]
    fn mirostat_v2_samples_within_vocab() {
        let params = SamplingParams {
            temp: 0.8,
            mirostat: 2,
            seed: 3,
            ..SamplingParams::default()
        };
        let mut chain = SamplerChain::new(params);
        let logits = vec![0.1, 0.5, 0.2, 0.9, 0.3];
        for _ in 0..16 {
            let token = chain.sample(&logits, 0);
            assert!((0..5).contains(&token));
        }
    }

    #[test]
    fn accept_window_is_bounded() {
        let params = SamplingParams {
            n_prev: 4,
            ..SamplingParams::default()
        };
        let mut chain = SamplerChain::new(params);
        for t in 0..10 {
            chain.accept(t, true);
        }
        assert_eq!(chain.prev.len(), 4);
        assert_eq!(chain.prev.front(), Some(&6));
    }
}
