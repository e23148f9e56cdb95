//! Scene state machine.
//!
//! The single source of truth for a visualization scene. One explicitly
//! constructed instance owns the object and widget registries, the mesh cache
//! and the set of viewer sessions; adapters and the network layer share it via
//! `Arc`.
//!
//! Concurrency:
//! - Registry writes are exclusive, reads (`get_*`) share a read lock.
//! - Every successful mutation publishes exactly one [`DiffEvent`] to every
//!   session queue while the write lock is still held, so all sessions see
//!   the same generation order.
//! - Draining copies state out and releases every lock before any I/O.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info, warn};

use crate::{
    config::SceneConfig,
    diff::{DiffEvent, Snapshot},
    error::{SceneError, SceneResult},
    event::{HostEvent, HostEventHub, UiInput},
    math::{Vec2i, Vec3},
    mesh::{load_mesh, MeshData, MeshLoader, MeshRef, NullMeshLoader},
    net::{NetMsg, ViewerInput},
    scene::{BoxSpec, MeshSpec, ObjectField, ObjectRegistry, SceneObject, ShadowFlags, Shape, SphereSpec},
    session::{Broadcaster, Pending, Session, SessionId, SessionInfo},
    widget::{CallbackId, PlotSeries, SliderSpec, UiWidget, WidgetField, WidgetKind, WidgetRegistry},
};

/// Both registries, guarded together.
#[derive(Default)]
pub struct SceneRegistry {
    pub objects: ObjectRegistry,
    pub widgets: WidgetRegistry,
}

impl SceneRegistry {
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            objects: self.objects.sorted(),
            widgets: self.widgets.sorted(),
        }
    }
}

pub struct SceneStateMachine {
    registry: RwLock<SceneRegistry>,
    broadcaster: Broadcaster,
    host_events: HostEventHub,
    mesh_loader: Box<dyn MeshLoader>,
}

impl Default for SceneStateMachine {
    fn default() -> Self {
        Self::new(&SceneConfig::default())
    }
}

impl SceneStateMachine {
    pub fn new(cfg: &SceneConfig) -> Self {
        Self {
            registry: RwLock::new(SceneRegistry::default()),
            broadcaster: Broadcaster::new(cfg.session_queue_capacity),
            host_events: HostEventHub::default(),
            mesh_loader: Box::new(NullMeshLoader),
        }
    }

    /// Replaces the mesh loading collaborator.
    pub fn with_mesh_loader(mut self, loader: impl MeshLoader + 'static) -> Self {
        self.mesh_loader = Box::new(loader);
        self
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn read(&self) -> RwLockReadGuard<'_, SceneRegistry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SceneRegistry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs a registry mutation and publishes its event under the write lock.
    fn commit<F>(&self, mutate: F) -> SceneResult<()>
    where
        F: FnOnce(&mut SceneRegistry) -> SceneResult<Option<DiffEvent>>,
    {
        let mut registry = self.write();
        if let Some(event) = mutate(&mut registry)? {
            self.broadcaster.publish(&event);
        }
        Ok(())
    }

    // ─── Objects ───

    /// Validates and stores a whole object. Non-finite values never reach the
    /// registry, so nothing unencodable is ever published.
    fn upsert_object(&self, object: SceneObject) -> SceneResult<()> {
        ensure_finite(&object.key, object.non_finite_field())?;
        self.commit(|reg| Ok(Some(reg.objects.upsert(object))))
    }

    fn update_object(&self, key: &str, field: ObjectField) -> SceneResult<()> {
        ensure_finite(key, field.non_finite())?;
        self.commit(|reg| reg.objects.update(key, field).map(Some))
    }

    pub fn create_box(&self, key: &str, spec: BoxSpec) -> SceneResult<()> {
        self.upsert_object(SceneObject {
            key: key.to_string(),
            shape: Shape::Box { size: spec.size },
            position: spec.position,
            rotation: spec.rotation,
            color: spec.color,
            shadows: spec.shadows,
        })
    }

    pub fn create_sphere(&self, key: &str, spec: SphereSpec) -> SceneResult<()> {
        self.upsert_object(SceneObject {
            key: key.to_string(),
            shape: Shape::Sphere {
                radius: spec.radius,
            },
            position: spec.position,
            rotation: Vec3::ZERO,
            color: spec.color,
            shadows: spec.shadows,
        })
    }

    pub fn create_line(&self, key: &str, points: Vec<Vec3>, color: Vec3) -> SceneResult<()> {
        self.upsert_object(SceneObject {
            key: key.to_string(),
            shape: Shape::Line { points },
            position: Vec3::ZERO,
            rotation: Vec3::ZERO,
            color,
            shadows: ShadowFlags::empty(),
        })
    }

    /// Creates a mesh object, loading geometry through the configured loader
    /// unless `spec.path` is already cached.
    ///
    /// Loading happens outside the registry lock. A load failure is logged
    /// and returned as [`SceneError::AssetLoad`]; the registry is untouched.
    pub fn create_mesh(&self, key: &str, spec: MeshSpec) -> SceneResult<()> {
        ensure_finite(key, spec.non_finite_field())?;
        let mut loaded = None;
        loop {
            if loaded.is_none() && !self.read().objects.meshes().contains(&spec.path) {
                loaded = Some(Arc::new(self.load(&spec.path)?));
            }

            let mut registry = self.write();
            let mesh = match (registry.objects.meshes_mut().acquire(&spec.path), loaded.take()) {
                (Some(mesh), _) => mesh,
                (None, Some(data)) => {
                    registry.objects.meshes_mut().acquire_or_insert(&spec.path, data)
                }
                // Evicted between the cache check and the write lock; the
                // guard drops here and the load is retried unlocked.
                (None, None) => continue,
            };
            let event = registry.objects.upsert(mesh_object(key, mesh, &spec));
            self.broadcaster.publish(&event);
            return Ok(());
        }
    }

    /// Creates a mesh object from geometry the caller already holds.
    pub fn create_mesh_from_data(
        &self,
        key: &str,
        data: Arc<MeshData>,
        spec: MeshSpec,
    ) -> SceneResult<()> {
        ensure_finite(key, spec.non_finite_field())?;
        data.validate().map_err(|reason| SceneError::AssetLoad {
            path: spec.path.clone(),
            reason,
        })?;
        self.commit(|reg| {
            let mesh = reg.objects.meshes_mut().acquire_or_insert(&spec.path, data);
            Ok(Some(reg.objects.upsert(mesh_object(key, mesh, &spec))))
        })
    }

    fn load(&self, path: &str) -> SceneResult<MeshData> {
        load_mesh(self.mesh_loader.as_ref(), path).inspect_err(|e| {
            warn!(path, error = %e, "Mesh load failed");
        })
    }

    pub fn set_object_position(&self, key: &str, position: Vec3) -> SceneResult<()> {
        self.update_object(key, ObjectField::Position(position))
    }

    pub fn set_object_rotation(&self, key: &str, euler: Vec3) -> SceneResult<()> {
        self.update_object(key, ObjectField::Rotation(euler))
    }

    pub fn set_object_color(&self, key: &str, color: Vec3) -> SceneResult<()> {
        self.update_object(key, ObjectField::Color(color))
    }

    pub fn get_object_position(&self, key: &str) -> SceneResult<Vec3> {
        self.read().objects.get(key).map(|o| o.position)
    }

    pub fn get_object_rotation(&self, key: &str) -> SceneResult<Vec3> {
        self.read().objects.get(key).map(|o| o.rotation)
    }

    pub fn get_object_color(&self, key: &str) -> SceneResult<Vec3> {
        self.read().objects.get(key).map(|o| o.color)
    }

    pub fn get_object(&self, key: &str) -> SceneResult<SceneObject> {
        self.read().objects.get(key).cloned()
    }

    pub fn has_object(&self, key: &str) -> bool {
        self.read().objects.contains(key)
    }

    pub fn object_count(&self) -> usize {
        self.read().objects.len()
    }

    pub fn cached_mesh_count(&self) -> usize {
        self.read().objects.meshes().len()
    }

    /// Removes an object. Deleting an unknown key is a logged no-op; returns
    /// whether anything was removed.
    pub fn delete_object(&self, key: &str) -> bool {
        let mut registry = self.write();
        match registry.objects.remove(key) {
            Some(event) => {
                self.broadcaster.publish(&event);
                true
            }
            None => false,
        }
    }

    /// Removes every object and widget.
    pub fn clear(&self) {
        let mut registry = self.write();
        registry.objects.clear();
        registry.widgets.clear();
        self.broadcaster.publish(&DiffEvent::Clear);
        info!("Scene cleared");
    }

    // ─── UI widgets ───

    pub fn create_text(
        &self,
        key: &str,
        contents: &str,
        from_top_left: Vec2i,
        size: Vec2i,
    ) -> SceneResult<()> {
        self.upsert_widget(
            key,
            from_top_left,
            size,
            WidgetKind::Text {
                contents: contents.to_string(),
            },
        )
    }

    pub fn create_button(
        &self,
        key: &str,
        label: &str,
        from_top_left: Vec2i,
        size: Vec2i,
        on_click: CallbackId,
    ) -> SceneResult<()> {
        self.upsert_widget(
            key,
            from_top_left,
            size,
            WidgetKind::Button {
                label: label.to_string(),
                on_click,
            },
        )
    }

    pub fn create_slider(
        &self,
        key: &str,
        from_top_left: Vec2i,
        size: Vec2i,
        slider: SliderSpec,
    ) -> SceneResult<()> {
        self.upsert_widget(key, from_top_left, size, WidgetKind::Slider(slider))
    }

    pub fn create_plot(
        &self,
        key: &str,
        from_top_left: Vec2i,
        size: Vec2i,
        series: PlotSeries,
        plot_type: &str,
    ) -> SceneResult<()> {
        self.upsert_widget(
            key,
            from_top_left,
            size,
            WidgetKind::Plot {
                series,
                plot_type: plot_type.to_string(),
            },
        )
    }

    fn upsert_widget(
        &self,
        key: &str,
        from_top_left: Vec2i,
        size: Vec2i,
        kind: WidgetKind,
    ) -> SceneResult<()> {
        ensure_finite(key, kind.non_finite_field())?;
        self.commit(|reg| {
            Ok(Some(reg.widgets.upsert(UiWidget {
                key: key.to_string(),
                from_top_left,
                size,
                kind,
            })))
        })
    }

    fn update_widget(&self, key: &str, field: WidgetField) -> SceneResult<()> {
        ensure_finite(key, field.non_finite())?;
        self.commit(|reg| reg.widgets.update(key, field).map(Some))
    }

    pub fn set_ui_element_position(&self, key: &str, from_top_left: Vec2i) -> SceneResult<()> {
        self.update_widget(key, WidgetField::Position(from_top_left))
    }

    pub fn set_ui_element_size(&self, key: &str, size: Vec2i) -> SceneResult<()> {
        self.update_widget(key, WidgetField::Size(size))
    }

    pub fn set_text_contents(&self, key: &str, contents: &str) -> SceneResult<()> {
        self.update_widget(key, WidgetField::Contents(contents.to_string()))
    }

    pub fn set_button_label(&self, key: &str, label: &str) -> SceneResult<()> {
        self.update_widget(key, WidgetField::Label(label.to_string()))
    }

    pub fn set_slider_value(&self, key: &str, value: f64) -> SceneResult<()> {
        self.update_widget(key, WidgetField::SliderValue(value))
    }

    pub fn set_slider_min(&self, key: &str, min: f64) -> SceneResult<()> {
        self.update_widget(key, WidgetField::SliderMin(min))
    }

    pub fn set_slider_max(&self, key: &str, max: f64) -> SceneResult<()> {
        self.update_widget(key, WidgetField::SliderMax(max))
    }

    pub fn set_plot_data(&self, key: &str, series: PlotSeries) -> SceneResult<()> {
        self.update_widget(key, WidgetField::PlotData(series))
    }

    pub fn get_ui_element(&self, key: &str) -> SceneResult<UiWidget> {
        self.read().widgets.get(key).cloned()
    }

    pub fn has_ui_element(&self, key: &str) -> bool {
        self.read().widgets.contains(key)
    }

    pub fn ui_element_count(&self) -> usize {
        self.read().widgets.len()
    }

    /// Removes a widget. Unknown keys are a logged no-op.
    pub fn delete_ui_element(&self, key: &str) -> bool {
        let mut registry = self.write();
        match registry.widgets.remove(key) {
            Some(event) => {
                self.broadcaster.publish(&event);
                true
            }
            None => false,
        }
    }

    // ─── Snapshot & sessions ───

    pub fn snapshot(&self) -> Snapshot {
        self.read().snapshot()
    }

    /// Registers a viewer session; its first drain yields a snapshot.
    pub fn open_session(&self, peer: Option<std::net::SocketAddr>) -> Arc<Session> {
        let session = self.broadcaster.open(peer);
        self.host_events.emit(HostEvent::SessionOpened(session.id()));
        session
    }

    /// Ends a session, discarding its queue. Other sessions are unaffected.
    pub fn close_session(&self, id: SessionId) {
        if self.broadcaster.close(id) {
            self.host_events.emit(HostEvent::SessionClosed(id));
        }
    }

    /// Next outbound message for a session, or `None` when nothing is
    /// pending. A new or overflowed session receives a snapshot taken
    /// atomically with the reset of its queue.
    pub fn drain_session(&self, id: SessionId) -> SceneResult<Option<NetMsg>> {
        let session = self
            .broadcaster
            .get(id)
            .ok_or(SceneError::UnknownSession(id))?;
        match session.take_pending() {
            Pending::Closed => Err(SceneError::UnknownSession(id)),
            Pending::Empty => Ok(None),
            Pending::Events(events) => Ok(Some(NetMsg::Diff { events })),
            Pending::NeedsSnapshot => {
                let registry = self.read();
                let snap = registry.snapshot();
                if !session.mark_resynced() {
                    return Err(SceneError::UnknownSession(id));
                }
                drop(registry);
                debug!(
                    session = ?id,
                    objects = snap.objects.len(),
                    widgets = snap.widgets.len(),
                    "Snapshot prepared"
                );
                Ok(Some(NetMsg::Snapshot(snap)))
            }
        }
    }

    /// Wakes every session writer to deliver what is queued.
    pub fn flush(&self) {
        self.broadcaster.flush();
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.broadcaster.list()
    }

    pub fn session_count(&self) -> usize {
        self.broadcaster.len()
    }

    // ─── Viewer input ───

    pub fn subscribe_host_events(&self) -> tokio::sync::mpsc::UnboundedReceiver<HostEvent> {
        self.host_events.subscribe()
    }

    /// Routes a viewer interaction to the host. Slider changes also update the
    /// authoritative slider value so other viewers follow.
    pub fn handle_input(&self, session: SessionId, input: ViewerInput) -> SceneResult<()> {
        match input {
            ViewerInput::ButtonClick { key } => {
                let callback = match self.read().widgets.get(&key)?.kind {
                    WidgetKind::Button { ref on_click, .. } => on_click.clone(),
                    _ => {
                        return Err(SceneError::WrongWidgetKind {
                            key,
                            expected: "button",
                        })
                    }
                };
                self.host_events.emit(HostEvent::Callback {
                    session,
                    widget: key,
                    callback,
                    input: UiInput::Click,
                });
            }
            ViewerInput::SliderChange { key, value } => {
                ensure_finite(&key, WidgetField::SliderValue(value).non_finite())?;
                let mut registry = self.write();
                let (callback, value) = match registry.widgets.get(&key)?.kind {
                    WidgetKind::Slider(ref s) => {
                        let value = if s.only_ints { value.round() } else { value };
                        (s.on_change.clone(), value)
                    }
                    _ => {
                        return Err(SceneError::WrongWidgetKind {
                            key,
                            expected: "slider",
                        })
                    }
                };
                let event = registry
                    .widgets
                    .update(&key, WidgetField::SliderValue(value))?;
                self.broadcaster.publish(&event);
                drop(registry);
                self.host_events.emit(HostEvent::Callback {
                    session,
                    widget: key,
                    callback,
                    input: UiInput::SliderValue(value),
                });
            }
            ViewerInput::KeyDown { key } => {
                self.host_events.emit(HostEvent::KeyDown { session, key });
            }
            ViewerInput::KeyUp { key } => {
                self.host_events.emit(HostEvent::KeyUp { session, key });
            }
        }
        Ok(())
    }
}

fn ensure_finite(key: &str, field: Option<&'static str>) -> SceneResult<()> {
    match field {
        Some(field) => {
            warn!(key, field, "Rejected non-finite value");
            Err(SceneError::NonFinite {
                key: key.to_string(),
                field,
            })
        }
        None => Ok(()),
    }
}

fn mesh_object(key: &str, mesh: MeshRef, spec: &MeshSpec) -> SceneObject {
    SceneObject {
        key: key.to_string(),
        shape: Shape::Mesh {
            mesh,
            scale: spec.scale,
        },
        position: spec.position,
        rotation: spec.rotation,
        color: spec.color,
        shadows: spec.shadows,
    }
}
