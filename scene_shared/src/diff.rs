//! Diff and snapshot encoding.
//!
//! A [`DiffEvent`] is the unit of incremental replication: one event per
//! successful registry mutation. A [`Snapshot`] is the full registry state
//! and stands in for the entire event history when a viewer (re)joins.

use serde::{Deserialize, Serialize};

use crate::{
    scene::{ObjectField, SceneObject},
    widget::{UiWidget, WidgetField},
};

/// Which registry a key lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Object,
    Widget,
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetKind::Object => f.write_str("object"),
            TargetKind::Widget => f.write_str("widget"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffOp {
    Create,
    Update,
    Delete,
    Clear,
}

/// One registry mutation.
///
/// Create events carry the complete entry; update events carry only the
/// fields the mutation touched; `Clear` resets both registries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DiffEvent {
    CreateObject(SceneObject),
    UpdateObject {
        key: String,
        fields: Vec<ObjectField>,
    },
    DeleteObject {
        key: String,
    },
    CreateWidget(UiWidget),
    UpdateWidget {
        key: String,
        fields: Vec<WidgetField>,
    },
    DeleteWidget {
        key: String,
    },
    Clear,
}

impl DiffEvent {
    pub fn op(&self) -> DiffOp {
        match self {
            DiffEvent::CreateObject(_) | DiffEvent::CreateWidget(_) => DiffOp::Create,
            DiffEvent::UpdateObject { .. } | DiffEvent::UpdateWidget { .. } => DiffOp::Update,
            DiffEvent::DeleteObject { .. } | DiffEvent::DeleteWidget { .. } => DiffOp::Delete,
            DiffEvent::Clear => DiffOp::Clear,
        }
    }

    /// `None` for `Clear`, which targets everything.
    pub fn target(&self) -> Option<TargetKind> {
        match self {
            DiffEvent::CreateObject(_)
            | DiffEvent::UpdateObject { .. }
            | DiffEvent::DeleteObject { .. } => Some(TargetKind::Object),
            DiffEvent::CreateWidget(_)
            | DiffEvent::UpdateWidget { .. }
            | DiffEvent::DeleteWidget { .. } => Some(TargetKind::Widget),
            DiffEvent::Clear => None,
        }
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            DiffEvent::CreateObject(o) => Some(&o.key),
            DiffEvent::CreateWidget(w) => Some(&w.key),
            DiffEvent::UpdateObject { key, .. }
            | DiffEvent::DeleteObject { key }
            | DiffEvent::UpdateWidget { key, .. }
            | DiffEvent::DeleteWidget { key } => Some(key),
            DiffEvent::Clear => None,
        }
    }
}

/// Full state of both registries, entries sorted by key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Snapshot {
    pub objects: Vec<SceneObject>,
    pub widgets: Vec<UiWidget>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty() && self.widgets.is_empty()
    }

    /// The snapshot expressed as one create event per entry.
    pub fn to_events(&self) -> Vec<DiffEvent> {
        self.objects
            .iter()
            .cloned()
            .map(DiffEvent::CreateObject)
            .chain(self.widgets.iter().cloned().map(DiffEvent::CreateWidget))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        math::Vec3,
        scene::{ShadowFlags, Shape, DEFAULT_COLOR},
    };

    #[test]
    fn accessors_describe_event() {
        let ev = DiffEvent::UpdateObject {
            key: "b1".into(),
            fields: vec![ObjectField::Position(Vec3::new(1.0, 2.0, 3.0))],
        };
        assert_eq!(ev.op(), DiffOp::Update);
        assert_eq!(ev.target(), Some(TargetKind::Object));
        assert_eq!(ev.key(), Some("b1"));
        assert_eq!(DiffEvent::Clear.target(), None);
    }

    #[test]
    fn update_wire_form_is_tagged_and_minimal() {
        let ev = DiffEvent::UpdateObject {
            key: "b1".into(),
            fields: vec![ObjectField::Position(Vec3::new(1.0, 2.0, 3.0))],
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event"], "update_object");
        assert_eq!(json["key"], "b1");
        assert_eq!(json["fields"].as_array().unwrap().len(), 1);
        assert_eq!(json["fields"][0]["field"], "position");
        let back: DiffEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn snapshot_to_events_is_one_create_per_entry() {
        let snap = Snapshot {
            objects: vec![SceneObject {
                key: "a".into(),
                shape: Shape::Sphere { radius: 0.5 },
                position: Vec3::ZERO,
                rotation: Vec3::ZERO,
                color: DEFAULT_COLOR,
                shadows: ShadowFlags::default(),
            }],
            widgets: Vec::new(),
        };
        let events = snap.to_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].op(), DiffOp::Create);
        assert!(Snapshot::default().is_empty());
    }
}
