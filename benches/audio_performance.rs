//! Audio Performance Benchmarks
//!
//! Checks that a block of audio is rendered well inside its real-time budget
//! at various sample rates, block sizes and polyphony levels.
//!
//! ## Real-Time Audio Constraints
//!
//! ```text
//! time_budget = block_size / sample_rate
//! ```
//!
//! | Sample Rate | Block 64   | Block 128  | Block 256  | Block 512  |
//! |-------------|------------|------------|------------|------------|
//! | 44.1 kHz    | 1.45 ms    | 2.90 ms    | 5.80 ms    | 11.61 ms   |
//! | 48 kHz      | 1.33 ms    | 2.67 ms    | 5.33 ms    | 10.67 ms   |
//! | 96 kHz      | 0.67 ms    | 1.33 ms    | 2.67 ms    | 5.33 ms    |

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use patchwire::prelude::*;

const SAMPLE_RATES: [f64; 3] = [44100.0, 48000.0, 96000.0];
const BLOCK_SIZES: [usize; 4] = [64, 128, 256, 512];
const VOICE_COUNTS: [usize; 4] = [1, 4, 8, 16];

// ============================================================================
// Helpers
// ============================================================================

/// Sequencer -> synth -> gain -> output
fn sequenced_patch(ctx: EngineContext) -> Scheduler {
    let mut patch = Patch::new(ctx);
    let seq = patch.add("seq", StepSequencer::new()).unwrap();
    let synth = patch.add("synth", PolySynth::new()).unwrap();
    let amp = patch.add("amp", Gain::new(0.5)).unwrap();
    let out = patch.add("out", AudioOutput::new(0)).unwrap();
    patch.connect(seq.out("notes").unwrap(), synth.in_("notes").unwrap()).unwrap();
    patch.connect(synth.out("out").unwrap(), amp.in_("in").unwrap()).unwrap();
    patch.connect(amp.out("out").unwrap(), out.in_("in").unwrap()).unwrap();
    Scheduler::new(patch, Transport::default(), 2, 2)
}

/// A synth holding `voices` notes into an output
fn held_chord(ctx: EngineContext, voices: usize) -> Scheduler {
    let mut patch = Patch::new(ctx);
    let synth = patch.add("synth", PolySynth::new()).unwrap();
    let out = patch.add("out", AudioOutput::new(0)).unwrap();
    patch.connect(synth.out("out").unwrap(), out.in_("in").unwrap()).unwrap();

    if let Some(synth) = patch.module_as::<PolySynth>(synth.id()) {
        let mut sink = NoteOutput::new();
        for i in 0..voices {
            synth.play_note(0, NoteMessage::on(0.0, 48 + i as i32, 100), &mut sink);
        }
    }
    Scheduler::new(patch, Transport::default(), 2, 2)
}

struct Io {
    input: Vec<f64>,
    left: Vec<f64>,
    right: Vec<f64>,
}

impl Io {
    fn new(block_size: usize) -> Self {
        Self {
            input: vec![0.0; block_size],
            left: vec![0.0; block_size],
            right: vec![0.0; block_size],
        }
    }

    fn run(&mut self, scheduler: &mut Scheduler) {
        scheduler.run_block(
            &[&self.input, &self.input],
            &mut [&mut self.left, &mut self.right],
        );
        black_box(&self.left);
    }
}

// ============================================================================
// Benchmarks
// ============================================================================

fn bench_block_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequenced_patch");
    for &sample_rate in &SAMPLE_RATES {
        for &block_size in &BLOCK_SIZES {
            let ctx = EngineContext::new(sample_rate, block_size);
            let mut scheduler = sequenced_patch(ctx);
            let mut io = Io::new(block_size);

            group.throughput(Throughput::Elements(block_size as u64));
            group.bench_with_input(
                BenchmarkId::new(format!("{}Hz", sample_rate as u32), block_size),
                &block_size,
                |b, _| b.iter(|| io.run(&mut scheduler)),
            );
        }
    }
    group.finish();
}

fn bench_polyphony(c: &mut Criterion) {
    let mut group = c.benchmark_group("polyphony");
    let ctx = EngineContext::default();
    for &voices in &VOICE_COUNTS {
        let mut scheduler = held_chord(ctx, voices);
        let mut io = Io::new(ctx.block_size);

        group.throughput(Throughput::Elements(ctx.block_size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(voices), &voices, |b, _| {
            b.iter(|| io.run(&mut scheduler))
        });
    }
    group.finish();
}

fn bench_transport(c: &mut Criterion) {
    let ctx = EngineContext::default();
    let mut transport = Transport::default();
    for interval in [
        NoteInterval::Quarter,
        NoteInterval::Eighth,
        NoteInterval::SixteenthTriplet,
        NoteInterval::ThirtySecond,
    ] {
        transport.add_listener(ListenerConfig::new(interval));
    }

    c.bench_function("transport_advance", |b| {
        b.iter(|| {
            let mut count = 0usize;
            transport.advance(black_box(ctx.block_duration_ms()), |_| count += 1);
            black_box(count)
        })
    });
}

fn bench_arrange(c: &mut Criterion) {
    c.bench_function("arrange_64_nodes", |b| {
        b.iter_batched(
            || {
                let mut patch = Patch::new(EngineContext::default());
                let mut prev: Option<NodeHandle> = None;
                for i in 0..64 {
                    let node = patch.add(format!("gain{}", i), Gain::default()).unwrap();
                    if let Some(prev) = &prev {
                        patch
                            .connect(prev.out("out").unwrap(), node.in_("in").unwrap())
                            .unwrap();
                    }
                    prev = Some(node);
                }
                patch
            },
            |mut patch| black_box(patch.arrange_dependencies()),
            criterion::BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    benches,
    bench_block_sizes,
    bench_polyphony,
    bench_transport,
    bench_arrange
);
criterion_main!(benches);
