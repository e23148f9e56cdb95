//! UI widget registry.
//!
//! 2D overlay elements share a single key namespace regardless of kind.
//! Callbacks are identifiers owned by the hosting application.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    diff::DiffEvent,
    error::{SceneError, SceneResult},
    math::Vec2i,
};

/// Identifier of a host-side callback attached to a widget.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct CallbackId(pub String);

impl CallbackId {
    pub fn new(id: impl Into<String>) -> Self {
        CallbackId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CallbackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Slider configuration and current value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliderSpec {
    pub min: f64,
    pub max: f64,
    pub value: f64,
    pub only_ints: bool,
    pub horizontal: bool,
    pub on_change: CallbackId,
}

impl Default for SliderSpec {
    fn default() -> Self {
        Self {
            min: 0.0,
            max: 1.0,
            value: 0.0,
            only_ints: false,
            horizontal: true,
            on_change: CallbackId::default(),
        }
    }
}

/// Data series of a plot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PlotSeries {
    pub xs: Vec<f64>,
    pub min_x: f64,
    pub max_x: f64,
    pub ys: Vec<f64>,
    pub min_y: f64,
    pub max_y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WidgetKind {
    Text { contents: String },
    Button { label: String, on_click: CallbackId },
    Slider(SliderSpec),
    Plot { series: PlotSeries, plot_type: String },
}

impl PlotSeries {
    fn is_finite(&self) -> bool {
        [self.min_x, self.max_x, self.min_y, self.max_y]
            .iter()
            .chain(&self.xs)
            .chain(&self.ys)
            .all(|v| v.is_finite())
    }
}

impl WidgetKind {
    /// Name of the first value holding a NaN or infinity, if any.
    pub fn non_finite_field(&self) -> Option<&'static str> {
        match self {
            WidgetKind::Slider(s) => [("min", s.min), ("max", s.max), ("value", s.value)]
                .into_iter()
                .find_map(|(name, v)| (!v.is_finite()).then_some(name)),
            WidgetKind::Plot { series, .. } => (!series.is_finite()).then_some("plot data"),
            WidgetKind::Text { .. } | WidgetKind::Button { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            WidgetKind::Text { .. } => "text",
            WidgetKind::Button { .. } => "button",
            WidgetKind::Slider(_) => "slider",
            WidgetKind::Plot { .. } => "plot",
        }
    }
}

/// A 2D overlay element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiWidget {
    pub key: String,
    pub from_top_left: Vec2i,
    pub size: Vec2i,
    pub kind: WidgetKind,
}

/// A single changed attribute of an existing widget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "snake_case")]
pub enum WidgetField {
    Position(Vec2i),
    Size(Vec2i),
    Contents(String),
    Label(String),
    OnClick(CallbackId),
    SliderValue(f64),
    SliderMin(f64),
    SliderMax(f64),
    SliderOnlyInts(bool),
    SliderHorizontal(bool),
    OnChange(CallbackId),
    PlotData(PlotSeries),
    PlotType(String),
}

impl WidgetField {
    /// Name of this field if it carries a NaN or infinite value.
    pub fn non_finite(&self) -> Option<&'static str> {
        match self {
            WidgetField::SliderValue(v) if !v.is_finite() => Some("value"),
            WidgetField::SliderMin(v) if !v.is_finite() => Some("min"),
            WidgetField::SliderMax(v) if !v.is_finite() => Some("max"),
            WidgetField::PlotData(series) if !series.is_finite() => Some("plot data"),
            _ => None,
        }
    }

    /// Widget kind this field belongs to, `None` for layout fields.
    fn required_kind(&self) -> Option<&'static str> {
        match self {
            WidgetField::Position(_) | WidgetField::Size(_) => None,
            WidgetField::Contents(_) => Some("text"),
            WidgetField::Label(_) | WidgetField::OnClick(_) => Some("button"),
            WidgetField::SliderValue(_)
            | WidgetField::SliderMin(_)
            | WidgetField::SliderMax(_)
            | WidgetField::SliderOnlyInts(_)
            | WidgetField::SliderHorizontal(_)
            | WidgetField::OnChange(_) => Some("slider"),
            WidgetField::PlotData(_) | WidgetField::PlotType(_) => Some("plot"),
        }
    }
}

impl UiWidget {
    /// Applies `field`; returns false if it does not fit this widget's kind.
    pub fn apply(&mut self, field: WidgetField) -> bool {
        match (field, &mut self.kind) {
            (WidgetField::Position(p), _) => self.from_top_left = p,
            (WidgetField::Size(s), _) => self.size = s,
            (WidgetField::Contents(c), WidgetKind::Text { contents }) => *contents = c,
            (WidgetField::Label(l), WidgetKind::Button { label, .. }) => *label = l,
            (WidgetField::OnClick(cb), WidgetKind::Button { on_click, .. }) => *on_click = cb,
            (WidgetField::SliderValue(v), WidgetKind::Slider(s)) => s.value = v,
            (WidgetField::SliderMin(v), WidgetKind::Slider(s)) => s.min = v,
            (WidgetField::SliderMax(v), WidgetKind::Slider(s)) => s.max = v,
            (WidgetField::SliderOnlyInts(v), WidgetKind::Slider(s)) => s.only_ints = v,
            (WidgetField::SliderHorizontal(v), WidgetKind::Slider(s)) => s.horizontal = v,
            (WidgetField::OnChange(cb), WidgetKind::Slider(s)) => s.on_change = cb,
            (WidgetField::PlotData(d), WidgetKind::Plot { series, .. }) => *series = d,
            (WidgetField::PlotType(t), WidgetKind::Plot { plot_type, .. }) => *plot_type = t,
            _ => return false,
        }
        true
    }

    /// Fields of `next` that differ from `self`. Only meaningful when both
    /// widgets have the same kind.
    pub fn changed_fields(&self, next: &UiWidget) -> Vec<WidgetField> {
        let mut fields = Vec::new();
        if self.from_top_left != next.from_top_left {
            fields.push(WidgetField::Position(next.from_top_left));
        }
        if self.size != next.size {
            fields.push(WidgetField::Size(next.size));
        }
        match (&self.kind, &next.kind) {
            (WidgetKind::Text { contents: a }, WidgetKind::Text { contents: b }) => {
                if a != b {
                    fields.push(WidgetField::Contents(b.clone()));
                }
            }
            (
                WidgetKind::Button {
                    label: la,
                    on_click: ca,
                },
                WidgetKind::Button {
                    label: lb,
                    on_click: cb,
                },
            ) => {
                if la != lb {
                    fields.push(WidgetField::Label(lb.clone()));
                }
                if ca != cb {
                    fields.push(WidgetField::OnClick(cb.clone()));
                }
            }
            (WidgetKind::Slider(a), WidgetKind::Slider(b)) => {
                if a.min != b.min {
                    fields.push(WidgetField::SliderMin(b.min));
                }
                if a.max != b.max {
                    fields.push(WidgetField::SliderMax(b.max));
                }
                if a.value != b.value {
                    fields.push(WidgetField::SliderValue(b.value));
                }
                if a.only_ints != b.only_ints {
                    fields.push(WidgetField::SliderOnlyInts(b.only_ints));
                }
                if a.horizontal != b.horizontal {
                    fields.push(WidgetField::SliderHorizontal(b.horizontal));
                }
                if a.on_change != b.on_change {
                    fields.push(WidgetField::OnChange(b.on_change.clone()));
                }
            }
            (
                WidgetKind::Plot {
                    series: sa,
                    plot_type: ta,
                },
                WidgetKind::Plot {
                    series: sb,
                    plot_type: tb,
                },
            ) => {
                if sa != sb {
                    fields.push(WidgetField::PlotData(sb.clone()));
                }
                if ta != tb {
                    fields.push(WidgetField::PlotType(tb.clone()));
                }
            }
            _ => {}
        }
        fields
    }
}

/// Keyed store of UI widgets.
#[derive(Default)]
pub struct WidgetRegistry {
    widgets: HashMap<String, UiWidget>,
}

impl WidgetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.widgets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.widgets.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.widgets.contains_key(key)
    }

    pub fn get(&self, key: &str) -> SceneResult<&UiWidget> {
        self.widgets
            .get(key)
            .ok_or_else(|| SceneError::widget_not_found(key))
    }

    /// Inserts or replaces `widget`, reporting a create for new keys or kind
    /// changes and an update with the differing fields otherwise.
    pub fn upsert(&mut self, widget: UiWidget) -> DiffEvent {
        let key = widget.key.clone();
        match self.widgets.get_mut(&key) {
            Some(existing) if existing.kind.name() == widget.kind.name() => {
                let fields = existing.changed_fields(&widget);
                *existing = widget;
                DiffEvent::UpdateWidget { key, fields }
            }
            Some(existing) => {
                *existing = widget.clone();
                DiffEvent::CreateWidget(widget)
            }
            None => {
                self.widgets.insert(key, widget.clone());
                DiffEvent::CreateWidget(widget)
            }
        }
    }

    /// Applies one field change; wrong-kind fields are rejected untouched.
    pub fn update(&mut self, key: &str, field: WidgetField) -> SceneResult<DiffEvent> {
        let widget = self
            .widgets
            .get_mut(key)
            .ok_or_else(|| SceneError::widget_not_found(key))?;
        if let Some(expected) = field.required_kind() {
            if widget.kind.name() != expected {
                return Err(SceneError::WrongWidgetKind {
                    key: key.to_string(),
                    expected,
                });
            }
        }
        widget.apply(field.clone());
        Ok(DiffEvent::UpdateWidget {
            key: key.to_string(),
            fields: vec![field],
        })
    }

    pub fn remove(&mut self, key: &str) -> Option<DiffEvent> {
        if self.widgets.remove(key).is_none() {
            warn!(key, "delete of unknown UI element ignored");
            return None;
        }
        Some(DiffEvent::DeleteWidget {
            key: key.to_string(),
        })
    }

    pub fn clear(&mut self) {
        self.widgets.clear();
    }

    /// All widgets sorted by key.
    pub fn sorted(&self) -> Vec<UiWidget> {
        let mut widgets: Vec<UiWidget> = self.widgets.values().cloned().collect();
        widgets.sort_by(|a, b| a.key.cmp(&b.key));
        widgets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(key: &str, contents: &str) -> UiWidget {
        UiWidget {
            key: key.to_string(),
            from_top_left: Vec2i::new(10, 10),
            size: Vec2i::new(200, 40),
            kind: WidgetKind::Text {
                contents: contents.to_string(),
            },
        }
    }

    fn slider(key: &str) -> UiWidget {
        UiWidget {
            key: key.to_string(),
            from_top_left: Vec2i::ZERO,
            size: Vec2i::new(100, 20),
            kind: WidgetKind::Slider(SliderSpec {
                min: 0.0,
                max: 10.0,
                value: 5.0,
                only_ints: false,
                horizontal: true,
                on_change: CallbackId::new("speed"),
            }),
        }
    }

    #[test]
    fn keys_are_shared_across_kinds() {
        let mut reg = WidgetRegistry::new();
        reg.upsert(text("w", "hello"));
        let ev = reg.upsert(slider("w"));
        assert!(matches!(ev, DiffEvent::CreateWidget(_)));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get("w").unwrap().kind.name(), "slider");
    }

    #[test]
    fn recreate_same_kind_reports_changed_fields() {
        let mut reg = WidgetRegistry::new();
        reg.upsert(text("t", "a"));
        let ev = reg.upsert(text("t", "b"));
        assert_eq!(
            ev,
            DiffEvent::UpdateWidget {
                key: "t".into(),
                fields: vec![WidgetField::Contents("b".into())],
            }
        );
    }

    #[test]
    fn wrong_kind_setter_is_rejected() {
        let mut reg = WidgetRegistry::new();
        reg.upsert(text("t", "a"));
        let err = reg.update("t", WidgetField::SliderValue(1.0)).unwrap_err();
        assert!(matches!(err, SceneError::WrongWidgetKind { expected: "slider", .. }));
        assert!(err.is_not_found());
        assert_eq!(
            reg.get("t").unwrap().kind,
            WidgetKind::Text {
                contents: "a".into()
            }
        );
    }

    #[test]
    fn layout_fields_apply_to_any_kind() {
        let mut reg = WidgetRegistry::new();
        reg.upsert(slider("s"));
        reg.update("s", WidgetField::Size(Vec2i::new(300, 30))).unwrap();
        assert_eq!(reg.get("s").unwrap().size, Vec2i::new(300, 30));
    }

    #[test]
    fn remove_missing_is_soft() {
        let mut reg = WidgetRegistry::new();
        assert!(reg.remove("ghost").is_none());
    }
}
