//! Simple Patch Example
//!
//! Builds a sequencer -> transposer -> synth -> output patch, renders two
//! seconds of audio and prints the layout.
//!
//! Run with: cargo run --example simple_patch

use patchwire::prelude::*;

fn main() -> Result<(), PatchError> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let engine = Engine::new(EngineConfig {
        tempo: 128.0,
        ..EngineConfig::default()
    });

    engine.edit(|patch| -> Result<(), PatchError> {
        let seq = patch.add("seq", StepSequencer::new())?;
        let shift = patch.add("shift", NoteTranspose::new(-12))?;
        let synth = patch.add("synth", PolySynth::new().with_voice_limit(4))?;
        let out = patch.add("out", AudioOutput::new(0))?;

        if let Some(seq) = patch.module_as::<StepSequencer>(seq.id()) {
            for (i, offset) in [0, 3, 7, 10, 12, 10, 7, 3].into_iter().enumerate() {
                seq.set_step(i, offset, true);
            }
        }

        patch.connect(seq.out("notes")?, shift.in_("notes")?)?;
        patch.connect(shift.out("notes")?, synth.in_("notes")?)?;
        patch.connect(synth.out("out")?, out.in_("in")?)?;
        Ok(())
    })?;

    let ctx = engine.ctx();
    let audio = engine.audio_handle();
    let input = vec![0.0; ctx.block_size];
    let mut left = vec![0.0; ctx.block_size];
    let mut right = vec![0.0; ctx.block_size];

    let blocks = (2000.0 / ctx.block_duration_ms()).ceil() as usize;
    let mut peak: f64 = 0.0;
    for _ in 0..blocks {
        audio.process(&[&input, &input], &mut [&mut left, &mut right]);
        peak = left.iter().fold(peak, |p, s| p.max(s.abs()));
    }

    println!("Rendered {} blocks, peak level {:.3}", blocks, peak);
    println!("{}", engine.layout().to_json()?);
    for event in engine.events() {
        println!("[{}] {}", event.kind, event.message);
    }
    Ok(())
}
