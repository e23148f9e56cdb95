//! Viewer-side scene model.
//!
//! Consumes the snapshot + diff stream exactly as a remote viewer would.
//! Replaying a session's stream onto a fresh mirror must reproduce the
//! authoritative registries.

use std::collections::BTreeMap;

use tracing::warn;

use crate::{
    diff::{DiffEvent, Snapshot},
    net::NetMsg,
    scene::SceneObject,
    widget::UiWidget,
};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SceneMirror {
    objects: BTreeMap<String, SceneObject>,
    widgets: BTreeMap<String, UiWidget>,
    snapshots_applied: u32,
    events_applied: u64,
}

impl SceneMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object(&self, key: &str) -> Option<&SceneObject> {
        self.objects.get(key)
    }

    pub fn widget(&self, key: &str) -> Option<&UiWidget> {
        self.widgets.get(key)
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn widget_count(&self) -> usize {
        self.widgets.len()
    }

    pub fn snapshots_applied(&self) -> u32 {
        self.snapshots_applied
    }

    pub fn events_applied(&self) -> u64 {
        self.events_applied
    }

    /// Replaces all state with `snap`.
    pub fn apply_snapshot(&mut self, snap: &Snapshot) {
        self.objects = snap
            .objects
            .iter()
            .map(|o| (o.key.clone(), o.clone()))
            .collect();
        self.widgets = snap
            .widgets
            .iter()
            .map(|w| (w.key.clone(), w.clone()))
            .collect();
        self.snapshots_applied += 1;
    }

    pub fn apply_event(&mut self, event: &DiffEvent) {
        self.events_applied += 1;
        match event {
            DiffEvent::CreateObject(o) => {
                self.objects.insert(o.key.clone(), o.clone());
            }
            DiffEvent::UpdateObject { key, fields } => match self.objects.get_mut(key) {
                Some(o) => fields.iter().cloned().for_each(|f| o.apply(f)),
                None => warn!(key = %key, "update for unknown object"),
            },
            DiffEvent::DeleteObject { key } => {
                self.objects.remove(key);
            }
            DiffEvent::CreateWidget(w) => {
                self.widgets.insert(w.key.clone(), w.clone());
            }
            DiffEvent::UpdateWidget { key, fields } => match self.widgets.get_mut(key) {
                Some(w) => {
                    for f in fields.iter().cloned() {
                        if !w.apply(f) {
                            warn!(key = %key, "field does not fit widget kind");
                        }
                    }
                }
                None => warn!(key = %key, "update for unknown widget"),
            },
            DiffEvent::DeleteWidget { key } => {
                self.widgets.remove(key);
            }
            DiffEvent::Clear => {
                self.objects.clear();
                self.widgets.clear();
            }
        }
    }

    /// Applies a server message; returns false for messages that carry no
    /// scene state.
    pub fn apply_msg(&mut self, msg: &NetMsg) -> bool {
        match msg {
            NetMsg::Snapshot(snap) => {
                self.apply_snapshot(snap);
                true
            }
            NetMsg::Diff { events } => {
                events.iter().for_each(|e| self.apply_event(e));
                true
            }
            _ => false,
        }
    }

    /// Current contents in snapshot form.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            objects: self.objects.values().cloned().collect(),
            widgets: self.widgets.values().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;
    use crate::{
        config::SceneConfig,
        math::{Vec2i, Vec3},
        scene::{BoxSpec, ObjectField},
        session::SessionId,
        state::SceneStateMachine,
    };

    fn mutate(scene: &SceneStateMachine, rng: &mut StdRng) {
        let key = format!("o{}", rng.gen_range(0..6));
        let x = rng.gen_range(-16..16) as f64 / 4.0;
        let _ = match rng.gen_range(0..7) {
            0 => scene.create_box(
                &key,
                BoxSpec {
                    position: Vec3::splat(x),
                    ..Default::default()
                },
            ),
            1 => scene.create_line(&key, vec![Vec3::ZERO, Vec3::splat(x)], Vec3::Z),
            2 => scene.set_object_position(&key, Vec3::new(x, 0.0, 0.0)),
            3 => {
                scene.delete_object(&key);
                Ok(())
            }
            4 => scene.create_text(&key, "t", Vec2i::new(0, 0), Vec2i::new(4, 4)),
            5 => scene.set_ui_element_size(&key, Vec2i::new(rng.gen_range(1..9), 3)),
            _ => {
                scene.delete_ui_element(&key);
                Ok(())
            }
        };
    }

    fn drain_into(scene: &SceneStateMachine, id: SessionId, mirror: &mut SceneMirror) {
        while let Some(msg) = scene.drain_session(id).unwrap() {
            assert!(mirror.apply_msg(&msg));
        }
    }

    #[test]
    fn replay_matches_source_under_overflow() {
        let scene = SceneStateMachine::new(&SceneConfig {
            session_queue_capacity: 5,
            ..Default::default()
        });
        let id = scene.open_session(None).id();
        let mut mirror = SceneMirror::new();
        let mut rng = StdRng::seed_from_u64(42);

        for round in 0..60 {
            // Bursts longer than the queue force resyncs.
            for _ in 0..rng.gen_range(1..12) {
                mutate(&scene, &mut rng);
            }
            drain_into(&scene, id, &mut mirror);
            assert_eq!(mirror.snapshot(), scene.snapshot(), "diverged in round {round}");
        }
        assert!(mirror.snapshots_applied() > 1);
        assert!(mirror.events_applied() > 0);
    }

    #[test]
    fn update_for_unknown_key_is_ignored() {
        let mut mirror = SceneMirror::new();
        mirror.apply_event(&DiffEvent::UpdateObject {
            key: "ghost".into(),
            fields: vec![ObjectField::Color(Vec3::ONE)],
        });
        assert_eq!(mirror.object_count(), 0);
        assert_eq!(mirror.events_applied(), 1);
    }

    #[test]
    fn non_scene_messages_are_not_applied() {
        let mut mirror = SceneMirror::new();
        assert!(!mirror.apply_msg(&NetMsg::Hello { protocol: 1 }));
        assert!(mirror.apply_msg(&NetMsg::Diff { events: vec![DiffEvent::Clear] }));
    }
}
