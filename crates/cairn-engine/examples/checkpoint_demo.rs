//! Headless demo -- walk down three segments, checkpoint, restore, carry on.
//!
//! Run with:
//!   RUST_LOG=cairn_persist=debug cargo run --example checkpoint_demo -p cairn-engine
//!
//! An observer thread prints the live snapshot while the simulation runs.
//! Pass a directory as the first argument to keep the artifact around;
//! otherwise everything goes into a temporary directory.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use cairn_engine::prelude::*;

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// Timer kind that restores one hit point to the avatar.
const REGEN: u16 = 1;

/// One-byte commands: the byte indexes `NEIGHBOURS`.
struct Walk;

impl Rules for Walk {
    fn on_command(
        &mut self,
        world: &mut WorldState,
        _registry: &mut IdentityRegistry,
        command: CommandToken,
    ) -> Result<(), WorldError> {
        let Some(&dir) = command.as_bytes().first() else {
            return Ok(());
        };
        let Some(from) = world.avatar_position() else {
            return Err(WorldError::AvatarNotPlaced);
        };
        let (dx, dy) = cairn_engine::snapshot::NEIGHBOURS[usize::from(dir) % 8];
        let to = from.offset(dx, dy);
        let open = world.active.terrain.get(to).is_some_and(Tile::is_walkable);
        if open && world.active.occupant(to).is_none() {
            world.avatar.position = Some(to);
        }
        Ok(())
    }

    fn on_timer(
        &mut self,
        world: &mut WorldState,
        registry: &mut IdentityRegistry,
        event: &TimerEvent,
    ) -> Result<(), WorldError> {
        if event.kind == REGEN {
            let vitals = &mut world.avatar.vitals;
            vitals.hp = (vitals.hp + 1).min(vitals.hp_max);
            let next = world.turn + 5;
            let avatar = world.avatar.id;
            world.schedule(registry, TimerScope::Global, next, avatar, REGEN, Vec::new())?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();
}

fn play(runtime: &mut Runtime, turns: u32) -> anyhow::Result<()> {
    let sender = runtime.sender();
    for turn in 0..turns {
        sender.try_send(CommandToken::new(vec![(turn % 8) as u8]))?;
        runtime.run_turn(&mut Walk)?;
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    init_tracing();

    let scratch = tempfile::tempdir()?;
    let root = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| scratch.path().to_path_buf());
    let save = root.join("demo.sav");

    let mut config = RuntimeConfig::default();
    config.persist.segment_dir = root.join("segments");
    let mut runtime = Runtime::new(config.clone());

    // 1. Observer.
    let publisher = runtime.publisher();
    let stop = Arc::new(AtomicBool::new(false));
    let observer = {
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut last = 0;
            while !stop.load(Ordering::Relaxed) {
                let snapshot = publisher.read();
                if snapshot.turn >= last + 10 {
                    last = snapshot.turn;
                    println!(
                        "turn {:>4}  segment {}  at ({:>2},{:>2})  hp {}/{}  nearby {:?}",
                        snapshot.turn,
                        snapshot.segment,
                        snapshot.x,
                        snapshot.y,
                        snapshot.hp,
                        snapshot.hp_max,
                        snapshot.features.map(|f| f.kind),
                    );
                }
                thread::sleep(Duration::from_millis(1));
            }
        })
    };

    // 2. Play three segments deep.
    runtime.new_game("demo")?;
    let avatar = runtime.world().context("no world after new game")?.avatar.id;
    runtime.schedule(TimerScope::Global, 5, avatar, REGEN, Vec::new())?;
    for depth in 2..=3 {
        play(&mut runtime, 20)?;
        runtime.travel(SegmentNumber(depth))?;
    }
    play(&mut runtime, 20)?;

    // 3. Checkpoint, then restore into a fresh runtime.
    let report = runtime
        .checkpoint(&save)
        .with_context(|| format!("checkpoint to {}", save.display()))?;
    println!(
        "checkpoint: {} bytes, segments {:?}, digest {}",
        report.bytes, report.consolidated, report.digest
    );
    let before = runtime.debug_dump()?;
    drop(runtime);

    let mut runtime = Runtime::new(config);
    let turn = runtime.restore(&save)?;
    anyhow::ensure!(runtime.debug_dump()? == before, "restored world differs");
    println!("restored at turn {turn}");

    play(&mut runtime, 30)?;
    runtime.travel(SegmentNumber(1))?;
    play(&mut runtime, 10)?;
    let report = runtime.checkpoint(&save)?;
    println!(
        "second checkpoint: {} bytes, backup {:?}",
        report.bytes, report.backup
    );

    stop.store(true, Ordering::Relaxed);
    observer
        .join()
        .map_err(|_| anyhow::anyhow!("observer thread panicked"))?;
    Ok(())
}
