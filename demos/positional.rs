//! Orbits a looping sound around the listener through a reverb zone.
//!
//! Usage: `cargo run --example positional -- <asset dir> <sound name> [music name]`

use anyhow::{Context, Result};
use soundstage::math::Vec3;
use soundstage::{
    EmitParams, EntityId, SlotParams, SlotSetKind, SoundFlags, SoundListener, SoundStage,
    SoundStageDesc, SoundWorld, ZoneEntity,
};
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct OrbitWorld {
    listener: SoundListener,
    entities: HashMap<EntityId, Vec3>,
    zones: Vec<ZoneEntity>,
}

impl SoundWorld for OrbitWorld {
    fn listener(&self) -> SoundListener {
        self.listener
    }

    fn entity_position(&self, id: EntityId) -> Option<Vec3> {
        self.entities.get(&id).copied()
    }

    fn zone_entities(&self) -> Vec<ZoneEntity> {
        self.zones.clone()
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let mut args = std::env::args().skip(1);
    let root = args.next().context("missing asset directory")?;
    let sound = args.next().context("missing sound name")?;
    let music = args.next();

    let desc = SoundStageDesc::default().distance_model(1.0, 64.0, 4000.0);
    let mut stage = SoundStage::with_cpal(desc, root)?;
    if !stage.init_sound() {
        log::error!("No audio device: {:?}", stage.sound_error());
        return Ok(());
    }

    let slot = stage.add_sound("orbit", &sound, SlotParams::new(), SlotSetKind::Game);
    let emitter = EntityId(1);
    let mut world = OrbitWorld {
        listener: SoundListener::default(),
        entities: HashMap::from([(emitter, Vec3::new(256.0, 0.0, 0.0))]),
        zones: vec![ZoneEntity::new(
            EntityId(100),
            Vec3::new(0.0, 0.0, -512.0),
            Vec3::splat(384.0),
            "cave",
        )],
    };
    stage.build_env_zones(&world);

    if let Some(track) = music.as_deref() {
        if !stage.play_music(track, true) {
            log::warn!("Music unavailable: {:?}", stage.sound_error());
        }
    }

    let flags = SoundFlags::new().looping().tracked().vel_est();
    let hook = stage.emit_sound(
        slot,
        Vec3::new(256.0, 0.0, 0.0),
        Some(emitter),
        None,
        EmitParams::new(flags),
    );
    if hook.is_none() {
        log::error!("Could not start '{}': {:?}", sound, stage.sound_error());
        return Ok(());
    }

    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(12) {
        let t = start.elapsed().as_secs_f32();
        let angle = t * std::f32::consts::TAU / 6.0;
        world
            .entities
            .insert(emitter, Vec3::new(angle.cos() * 256.0, 0.0, angle.sin() * 256.0));
        // Walk into the cave halfway through.
        let z = if t > 6.0 { -512.0 } else { 0.0 };
        world.listener = SoundListener::at(Vec3::new(0.0, 0.0, z));

        stage.update_sounds(&world, start.elapsed().as_millis() as u64);
        for event in stage.poll_events() {
            log::info!("{:?}", event);
        }
        std::thread::sleep(Duration::from_millis(16));
    }

    let mut dump = Vec::new();
    stage.dump_sound_envs(&mut dump)?;
    log::info!("Environments:\n{}", String::from_utf8_lossy(&dump));
    stage.stop_sound();
    Ok(())
}
