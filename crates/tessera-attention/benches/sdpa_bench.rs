//! Benchmark: scalar vs generic vs tiled single-head attention, and
//! multi-head throughput with and without the worker pool.

use std::time::Instant;

use tessera_attention::{
    multi_head_sdpa, run_tier, AttentionContext, AttentionProblem, MultiHeadDesc, SdpaTier,
};
use tessera_kernels::{
    resolve_kernels, Capabilities, KernelConfig, KernelSet, Scratch, ScratchPool, WorkerPool,
};

fn data(n: usize, mul: usize, add: usize) -> Vec<f32> {
    (0..n).map(|i| ((i * mul + add) % 13) as f32 * 0.1 - 0.6).collect()
}

fn bench_tier(tier: SdpaTier, kernels: &KernelSet, p: &AttentionProblem, iters: usize) -> f64 {
    let q = data(p.q_len(), 7, 3);
    let k = data(p.kv_elems(), 11, 5);
    let v = data(p.kv_elems(), 3, 1);
    let mut out = vec![0.0; p.q_len()];
    let mut scratch = Scratch::new();

    let start = Instant::now();
    for _ in 0..iters {
        run_tier(tier, kernels, p, &q, &k, &v, None, &mut out, &mut scratch).unwrap();
    }
    start.elapsed().as_secs_f64() / iters as f64
}

fn bench_multi_head(
    kernels: &KernelSet,
    pool: Option<&WorkerPool>,
    desc: &MultiHeadDesc,
    iters: usize,
) -> f64 {
    let q = data(desc.batch * desc.num_heads * desc.seq_len * desc.head_dim, 7, 3);
    let kv_n = desc.batch * desc.num_kv_heads * desc.kv_len * desc.head_dim;
    let (k, v) = (data(kv_n, 11, 5), data(kv_n, 3, 1));
    let mut out = vec![0.0; q.len()];
    let scratch = ScratchPool::new(pool.map_or(1, |p| p.size()));
    let ctx = AttentionContext { kernels, pool, scratch: &scratch };
    let scale = 1.0 / (desc.head_dim as f32).sqrt();
    let (q_s, kv_s) = (desc.q_bhsd(), desc.kv_bhsd());

    let start = Instant::now();
    for _ in 0..iters {
        multi_head_sdpa(&ctx, desc, &q, q_s, &k, &v, kv_s, None, &mut out, scale, true).unwrap();
    }
    start.elapsed().as_secs_f64() / iters as f64
}

fn gflops(p: &AttentionProblem, secs: f64) -> f64 {
    // QKᵀ and PV, one multiply-add each.
    (4.0 * p.seq_len as f64 * p.kv_len as f64 * p.head_dim as f64) / secs / 1e9
}

fn main() {
    let caps = Capabilities::detect();
    let kernels = resolve_kernels(caps, &KernelConfig::default());
    println!("=== Tessera SDPA Benchmark ===");
    println!(
        "SIMD: {} (avx2={}, avx512={}, fma={}, neon={})",
        caps.best_tier(),
        caps.avx2,
        caps.avx512f,
        caps.fma,
        caps.neon
    );
    println!("Kernels: {}\n", kernels.describe());

    let sizes: &[(usize, usize)] = &[(64, 64), (128, 64), (256, 64), (512, 128), (33, 33)];

    println!(
        "{:<14} {:>12} {:>12} {:>12} {:>10}",
        "seq x dim", "Scalar (ms)", "Generic (ms)", "Tiled (ms)", "Tiled GF/s"
    );
    println!("{}", "-".repeat(64));

    for &(seq, dim) in sizes {
        let p = AttentionProblem::new(seq, seq, dim, 1.0 / (dim as f32).sqrt(), false);
        let iters = if seq <= 64 { 200 } else if seq <= 256 { 20 } else { 4 };

        let scalar_s = bench_tier(SdpaTier::Scalar, &kernels, &p, iters);
        let generic_s = bench_tier(SdpaTier::Generic, &kernels, &p, iters);
        let tiled_s = bench_tier(SdpaTier::Tiled, &kernels, &p, iters);

        println!(
            "{:<14} {:>10.3}ms {:>10.3}ms {:>10.3}ms {:>10.2}",
            format!("{seq}x{dim}"),
            scalar_s * 1e3,
            generic_s * 1e3,
            tiled_s * 1e3,
            gflops(&p, tiled_s)
        );
    }

    let desc = MultiHeadDesc {
        batch: 2,
        num_heads: 16,
        num_kv_heads: 4,
        seq_len: 128,
        kv_len: 128,
        head_dim: 64,
    };
    let pool = WorkerPool::new(&tessera_kernels::PoolConfig::default()).unwrap();
    let seq_s = bench_multi_head(&kernels, None, &desc, 10);
    let par_s = bench_multi_head(&kernels, Some(&pool), &desc, 10);
    println!("\nGQA 2x16/4 heads, 128x128x64 causal:");
    println!("  sequential {:>8.3}ms", seq_s * 1e3);
    println!("  pool({})    {:>8.3}ms  ({:.1}x)", pool.size(), par_s * 1e3, seq_s / par_s);
}
