//! Render adapters.
//!
//! One-way translators from simulation views into scene primitives. Every
//! adapter takes a caller-chosen `prefix` and derives its object keys from
//! it plus stable domain names, so calling again with the same prefix updates
//! the same objects instead of creating new ones. The registry does not track
//! prefixes; surplus keys from an earlier, larger batch are found by probing
//! the next index until it is absent.
//!
//! Key segments are joined with `.`. Domain names (skeletons, links, bodies)
//! have `\` and `.` backslash-escaped, so each name stays one segment and
//! distinct names never map to the same key.

use std::{borrow::Cow, collections::BTreeMap};

use tracing::warn;

use crate::{
    error::{SceneError, SceneResult},
    math::{Mat3, Vec3},
    physics::{BodyView, LinkVisual, SkeletonView, VisualShape, WorldView},
    scene::{BoxSpec, MeshSpec, SceneObject, ShadowFlags, Shape, SphereSpec},
    state::SceneStateMachine,
};

pub const RED: Vec3 = Vec3::new(1.0, 0.0, 0.0);
pub const GREEN: Vec3 = Vec3::new(0.0, 1.0, 0.0);
pub const BLUE: Vec3 = Vec3::new(0.0, 0.0, 1.0);

/// Newtons to meters for contact force lines.
pub const FORCE_SCALE: f64 = 0.001;
/// Length of a contact force line when magnitudes are not rendered.
pub const UNIT_FORCE_LENGTH: f64 = 0.1;

const TRAJECTORY_PALETTE: [Vec3; 4] = [
    Vec3::new(0.9, 0.4, 0.1),
    Vec3::new(0.1, 0.6, 0.9),
    Vec3::new(0.3, 0.8, 0.3),
    Vec3::new(0.8, 0.2, 0.7),
];

/// Escapes `\` and `.` so `name` cannot be mistaken for several segments.
fn segment(name: &str) -> Cow<'_, str> {
    if !name.contains(['.', '\\']) {
        return Cow::Borrowed(name);
    }
    let mut out = String::with_capacity(name.len() + 2);
    for c in name.chars() {
        if matches!(c, '.' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    Cow::Owned(out)
}

pub fn skeleton_key(prefix: &str, skeleton: &str, link: &str, index: usize) -> String {
    format!("{prefix}.{}.{}.{index}", segment(skeleton), segment(link))
}

pub fn force_key(prefix: &str, index: usize) -> String {
    format!("{prefix}.force.{index}")
}

pub fn basis_key(prefix: &str, axis: &str) -> String {
    format!("{prefix}.{axis}")
}

pub fn trajectory_key(prefix: &str, body: &str) -> String {
    format!("{prefix}.{}", segment(body))
}

pub fn wrench_keys(prefix: &str, body: &str) -> [String; 2] {
    let body = segment(body);
    [
        format!("{prefix}.{body}.torque"),
        format!("{prefix}.{body}.force"),
    ]
}

pub fn vertex_key(prefix: &str, body: &str, index: usize) -> String {
    format!("{prefix}.{}.{index}", segment(body))
}

/// Deletes `key(start)`, `key(start + 1)`, ... until one is absent.
fn delete_from(scene: &SceneStateMachine, start: usize, key: impl Fn(usize) -> String) -> usize {
    let mut i = start;
    loop {
        let k = key(i);
        if !scene.has_object(&k) {
            return i - start;
        }
        scene.delete_object(&k);
        i += 1;
    }
}

fn same_geometry(existing: &Shape, visual: &VisualShape) -> bool {
    match (existing, visual) {
        (Shape::Box { size: a }, VisualShape::Box { size: b }) => a == b,
        (Shape::Sphere { radius: a }, VisualShape::Sphere { radius: b }) => a == b,
        (Shape::Mesh { mesh, scale }, VisualShape::Mesh { path, scale: s }) => {
            &mesh.path == path && scale == s
        }
        _ => false,
    }
}

fn create_visual(scene: &SceneStateMachine, key: &str, v: &LinkVisual, color: Vec3) -> SceneResult<()> {
    match &v.shape {
        VisualShape::Box { size } => scene.create_box(
            key,
            BoxSpec {
                size: *size,
                position: v.position,
                rotation: v.rotation,
                color,
                shadows: ShadowFlags::default(),
            },
        ),
        VisualShape::Sphere { radius } => scene.create_sphere(
            key,
            SphereSpec {
                radius: *radius,
                position: v.position,
                color,
                shadows: ShadowFlags::default(),
            },
        ),
        VisualShape::Mesh { path, scale } => scene.create_mesh(
            key,
            MeshSpec {
                path: path.clone(),
                position: v.position,
                rotation: v.rotation,
                scale: *scale,
                color,
                shadows: ShadowFlags::default(),
            },
        ),
    }
}

/// Sends only the transform/color fields that moved since the last render.
fn update_visual(
    scene: &SceneStateMachine,
    existing: &SceneObject,
    v: &LinkVisual,
    color: Vec3,
) -> SceneResult<()> {
    let key = &existing.key;
    if existing.position != v.position {
        scene.set_object_position(key, v.position)?;
    }
    if existing.rotation != v.rotation && !matches!(v.shape, VisualShape::Sphere { .. }) {
        scene.set_object_rotation(key, v.rotation)?;
    }
    if existing.color != color {
        scene.set_object_color(key, color)?;
    }
    Ok(())
}

/// Renders every visual of `skeleton`. The first call creates the objects;
/// later calls with the same prefix only move or recolor them.
///
/// Returns the number of visuals rendered. Visuals whose mesh fails to load
/// or whose pose is not finite are skipped with a warning.
pub fn render_skeleton(
    scene: &SceneStateMachine,
    skeleton: &dyn SkeletonView,
    prefix: &str,
    override_color: Option<Vec3>,
) -> SceneResult<usize> {
    let mut rendered = 0;
    for visual in skeleton.visuals() {
        let key = skeleton_key(prefix, skeleton.name(), &visual.link, visual.index);
        let color = override_color.unwrap_or(visual.color);
        let result = match scene.get_object(&key) {
            Ok(existing) if same_geometry(&existing.shape, &visual.shape) => {
                update_visual(scene, &existing, &visual, color)
            }
            _ => create_visual(scene, &key, &visual, color),
        };
        match result {
            Ok(()) => rendered += 1,
            Err(SceneError::AssetLoad { path, reason }) => {
                warn!(key = %key, path = %path, reason = %reason, "Skipping visual");
            }
            Err(e @ SceneError::NonFinite { .. }) => {
                warn!(key = %key, error = %e, "Skipping visual");
            }
            // Deleted by someone else between read and update; recreate.
            Err(e) if e.is_not_found() => {
                create_visual(scene, &key, &visual, color)?;
                rendered += 1;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(rendered)
}

/// Renders all skeletons of `world` and, optionally, its contact forces.
///
/// With `render_force_magnitudes` the force lines scale with the force;
/// otherwise every line has the same length and only shows direction.
pub fn render_world(
    scene: &SceneStateMachine,
    world: &dyn WorldView,
    prefix: &str,
    render_forces: bool,
    render_force_magnitudes: bool,
) -> SceneResult<usize> {
    let mut rendered = 0;
    for skeleton in world.skeletons() {
        rendered += render_skeleton(scene, skeleton, prefix, None)?;
    }

    let mut forces_drawn = 0;
    if render_forces {
        for (i, contact) in world.contact_forces().iter().enumerate() {
            let arrow = if render_force_magnitudes {
                contact.force * FORCE_SCALE
            } else {
                contact.force.normalized() * UNIT_FORCE_LENGTH
            };
            scene.create_line(
                &force_key(prefix, i),
                vec![contact.point, contact.point + arrow],
                RED,
            )?;
            forces_drawn += 1;
        }
    }
    delete_from(scene, forces_drawn, |i| force_key(prefix, i));
    Ok(rendered + forces_drawn)
}

/// Draws a red/green/blue XYZ basis of length `scale` at `pos`, rotated by
/// the Euler angles `euler`.
pub fn render_basis(
    scene: &SceneStateMachine,
    scale: f64,
    prefix: &str,
    pos: Vec3,
    euler: Vec3,
) -> SceneResult<()> {
    let rot = Mat3::from_euler_xyz(euler);
    for (axis, color, name) in [(Vec3::X, RED, "x"), (Vec3::Y, GREEN, "y"), (Vec3::Z, BLUE, "z")] {
        let tip = pos + rot.mul_vec3(axis) * scale;
        scene.create_line(&basis_key(prefix, name), vec![pos, tip], color)?;
    }
    Ok(())
}

/// Draws one polyline per body through its positions over a trajectory.
/// `positions` holds one generalized position vector per timestep.
pub fn render_trajectory_lines(
    scene: &SceneStateMachine,
    world: &dyn WorldView,
    positions: &[Vec<f64>],
    prefix: &str,
) -> SceneResult<usize> {
    let mut paths: BTreeMap<String, Vec<Vec3>> = BTreeMap::new();
    for q in positions {
        for (body, p) in world.body_positions(q) {
            paths.entry(body).or_default().push(p);
        }
    }
    for (i, (body, points)) in paths.iter().enumerate() {
        let color = TRAJECTORY_PALETTE[i % TRAJECTORY_PALETTE.len()];
        scene.create_line(&trajectory_key(prefix, body), points.clone(), color)?;
    }
    Ok(paths.len())
}

/// Draws a body wrench `[torque; force]` as two lines from the body origin.
pub fn render_body_wrench(
    scene: &SceneStateMachine,
    body: &dyn BodyView,
    wrench: [f64; 6],
    scale_factor: f64,
    prefix: &str,
) -> SceneResult<()> {
    let origin = body.world_position();
    let torque = Vec3::new(wrench[0], wrench[1], wrench[2]);
    let force = Vec3::new(wrench[3], wrench[4], wrench[5]);
    let [torque_key, force_key] = wrench_keys(prefix, body.name());
    scene.create_line(&torque_key, vec![origin, origin + torque * scale_factor], BLUE)?;
    scene.create_line(&force_key, vec![origin, origin + force * scale_factor], RED)?;
    Ok(())
}

/// Removes exactly the lines [`render_body_wrench`] created for this body and
/// prefix.
pub fn clear_body_wrench(scene: &SceneStateMachine, body: &dyn BodyView, prefix: &str) -> usize {
    wrench_keys(prefix, body.name())
        .iter()
        .filter(|k| scene.has_object(k) && scene.delete_object(k))
        .count()
}

/// Draws a velocity line at every moving vertex of `body`.
pub fn render_moving_body_node_vertices(
    scene: &SceneStateMachine,
    body: &dyn BodyView,
    scale_factor: f64,
    prefix: &str,
) -> SceneResult<usize> {
    let vertices = body.moving_vertices();
    for (i, (v, vel)) in vertices.iter().enumerate() {
        scene.create_line(
            &vertex_key(prefix, body.name(), i),
            vec![*v, *v + *vel * scale_factor],
            GREEN,
        )?;
    }
    delete_from(scene, vertices.len(), |i| vertex_key(prefix, body.name(), i));
    Ok(vertices.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{diff::DiffEvent, net::NetMsg, physics::ContactForce, scene::ObjectField};

    struct Pendulum {
        angle: f64,
    }

    impl SkeletonView for Pendulum {
        fn name(&self) -> &str {
            "pendulum"
        }

        fn visuals(&self) -> Vec<LinkVisual> {
            (0..3)
                .map(|i| LinkVisual {
                    link: format!("link{i}"),
                    index: 0,
                    shape: VisualShape::Box {
                        size: Vec3::new(0.1, 0.1, 1.0),
                    },
                    position: Vec3::new(self.angle.sin() * i as f64, 0.0, -(i as f64)),
                    rotation: Vec3::new(0.0, self.angle, 0.0),
                    color: Vec3::splat(0.7),
                })
                .collect()
        }
    }

    struct Contacts {
        pendulum: Pendulum,
        forces: Vec<ContactForce>,
    }

    impl WorldView for Contacts {
        fn skeletons(&self) -> Vec<&dyn SkeletonView> {
            vec![&self.pendulum as &dyn SkeletonView]
        }

        fn contact_forces(&self) -> Vec<ContactForce> {
            self.forces.clone()
        }

        fn body_positions(&self, q: &[f64]) -> Vec<(String, Vec3)> {
            vec![
                ("root".to_string(), Vec3::new(q[0], 0.0, 0.0)),
                ("tip".to_string(), Vec3::new(q[0], 0.0, -1.0)),
            ]
        }
    }

    struct Body {
        vertices: Vec<(Vec3, Vec3)>,
    }

    impl BodyView for Body {
        fn name(&self) -> &str {
            "torso"
        }

        fn world_position(&self) -> Vec3 {
            Vec3::new(0.0, 1.0, 0.0)
        }

        fn moving_vertices(&self) -> Vec<(Vec3, Vec3)> {
            self.vertices.clone()
        }
    }

    fn drain_all(scene: &SceneStateMachine, id: crate::session::SessionId) -> Vec<DiffEvent> {
        let mut events = Vec::new();
        while let Some(msg) = scene.drain_session(id).unwrap() {
            if let NetMsg::Diff { events: batch } = msg {
                events.extend(batch);
            }
        }
        events
    }

    #[test]
    fn same_prefix_updates_rather_than_duplicates() {
        let scene = SceneStateMachine::default();
        let id = scene.open_session(None).id();
        drain_all(&scene, id);

        assert_eq!(render_skeleton(&scene, &Pendulum { angle: 0.0 }, "skel", None).unwrap(), 3);
        let first: Vec<String> = drain_all(&scene, id)
            .iter()
            .filter_map(|e| e.key().map(str::to_string))
            .collect();
        assert_eq!(scene.object_count(), 3);

        render_skeleton(&scene, &Pendulum { angle: 0.3 }, "skel", None).unwrap();
        assert_eq!(scene.object_count(), 3);
        let second = drain_all(&scene, id);
        assert!(second
            .iter()
            .all(|e| matches!(e, DiffEvent::UpdateObject { .. })));
        for e in &second {
            assert!(first.contains(&e.key().unwrap().to_string()));
        }
        assert!(scene.has_object("skel.pendulum.link2.0"));
    }

    #[test]
    fn unchanged_pose_emits_nothing() {
        let scene = SceneStateMachine::default();
        render_skeleton(&scene, &Pendulum { angle: 0.1 }, "p", None).unwrap();
        let id = scene.open_session(None).id();
        drain_all(&scene, id);
        render_skeleton(&scene, &Pendulum { angle: 0.1 }, "p", None).unwrap();
        assert!(drain_all(&scene, id).is_empty());
    }

    #[test]
    fn override_color_recolors() {
        let scene = SceneStateMachine::default();
        render_skeleton(&scene, &Pendulum { angle: 0.0 }, "gold", Some(Vec3::new(1.0, 0.8, 0.0)))
            .unwrap();
        assert_eq!(
            scene.get_object_color("gold.pendulum.link0.0").unwrap(),
            Vec3::new(1.0, 0.8, 0.0)
        );
    }

    #[test]
    fn mesh_visual_without_loader_is_skipped() {
        struct MeshSkel;
        impl SkeletonView for MeshSkel {
            fn name(&self) -> &str {
                "m"
            }
            fn visuals(&self) -> Vec<LinkVisual> {
                vec![LinkVisual {
                    link: "hand".into(),
                    index: 0,
                    shape: VisualShape::Mesh {
                        path: "hand.stl".into(),
                        scale: Vec3::ONE,
                    },
                    position: Vec3::ZERO,
                    rotation: Vec3::ZERO,
                    color: Vec3::ONE,
                }]
            }
        }
        let scene = SceneStateMachine::default();
        assert_eq!(render_skeleton(&scene, &MeshSkel, "w", None).unwrap(), 0);
        assert_eq!(scene.object_count(), 0);
    }

    struct Named {
        skeleton: &'static str,
        link: &'static str,
        position: Vec3,
    }

    impl SkeletonView for Named {
        fn name(&self) -> &str {
            self.skeleton
        }

        fn visuals(&self) -> Vec<LinkVisual> {
            vec![LinkVisual {
                link: self.link.into(),
                index: 0,
                shape: VisualShape::Sphere { radius: 0.1 },
                position: self.position,
                rotation: Vec3::ZERO,
                color: Vec3::ONE,
            }]
        }
    }

    #[test]
    fn dotted_names_get_distinct_keys() {
        let scene = SceneStateMachine::default();
        let left = Named {
            skeleton: "arm.left",
            link: "hand",
            position: Vec3::X,
        };
        let right = Named {
            skeleton: "arm",
            link: "left.hand",
            position: Vec3::Y,
        };
        render_skeleton(&scene, &left, "w", None).unwrap();
        render_skeleton(&scene, &right, "w", None).unwrap();
        assert_eq!(scene.object_count(), 2);
        assert_eq!(scene.get_object_position(r"w.arm\.left.hand.0").unwrap(), Vec3::X);
        assert_eq!(scene.get_object_position(r"w.arm.left\.hand.0").unwrap(), Vec3::Y);

        assert_ne!(vertex_key("v", "a.1", 0), vertex_key("v", "a", 10));
        assert_ne!(trajectory_key("t", r"a\"), trajectory_key("t", r"a\\"));
        assert_eq!(wrench_keys("f", "torso")[0], "f.torso.torque");
    }

    #[test]
    fn non_finite_visual_is_skipped() {
        let scene = SceneStateMachine::default();
        let good = Named {
            skeleton: "s",
            link: "ok",
            position: Vec3::ZERO,
        };
        let bad = Named {
            skeleton: "s",
            link: "blown",
            position: Vec3::new(f64::NAN, 0.0, 0.0),
        };
        assert_eq!(render_skeleton(&scene, &good, "w", None).unwrap(), 1);
        assert_eq!(render_skeleton(&scene, &bad, "w", None).unwrap(), 0);
        assert!(!scene.has_object("w.s.blown.0"));

        let moved = Named {
            position: Vec3::new(0.0, f64::INFINITY, 0.0),
            ..good
        };
        assert_eq!(render_skeleton(&scene, &moved, "w", None).unwrap(), 0);
        assert_eq!(scene.get_object_position("w.s.ok.0").unwrap(), Vec3::ZERO);
    }

    #[test]
    fn world_forces_shrink_when_contacts_disappear() {
        let scene = SceneStateMachine::default();
        let mut world = Contacts {
            pendulum: Pendulum { angle: 0.0 },
            forces: vec![
                ContactForce {
                    point: Vec3::ZERO,
                    force: Vec3::new(0.0, 0.0, 100.0),
                },
                ContactForce {
                    point: Vec3::X,
                    force: Vec3::new(0.0, 0.0, 50.0),
                },
            ],
        };
        assert_eq!(render_world(&scene, &world, "world", true, true).unwrap(), 5);
        assert!(scene.has_object(&force_key("world", 1)));

        world.forces.truncate(1);
        render_world(&scene, &world, "world", true, false).unwrap();
        assert!(scene.has_object(&force_key("world", 0)));
        assert!(!scene.has_object(&force_key("world", 1)));

        render_world(&scene, &world, "world", false, false).unwrap();
        assert!(!scene.has_object(&force_key("world", 0)));
        assert_eq!(scene.object_count(), 3);
    }

    #[test]
    fn basis_axes_follow_rotation() {
        let scene = SceneStateMachine::default();
        render_basis(
            &scene,
            2.0,
            "basis",
            Vec3::ZERO,
            Vec3::new(0.0, 0.0, std::f64::consts::FRAC_PI_2),
        )
        .unwrap();
        let x = scene.get_object("basis.x").unwrap();
        match x.shape {
            Shape::Line { points } => {
                assert!((points[1] - Vec3::new(0.0, 2.0, 0.0)).len() < 1e-9);
            }
            other => panic!("expected line, got {other:?}"),
        }
        assert_eq!(x.color, RED);
        assert!(scene.has_object("basis.y") && scene.has_object("basis.z"));
    }

    #[test]
    fn trajectory_has_one_line_per_body() {
        let scene = SceneStateMachine::default();
        let world = Contacts {
            pendulum: Pendulum { angle: 0.0 },
            forces: Vec::new(),
        };
        let traj = vec![vec![0.0], vec![1.0], vec![2.0]];
        assert_eq!(render_trajectory_lines(&scene, &world, &traj, "traj").unwrap(), 2);
        match scene.get_object("traj.tip").unwrap().shape {
            Shape::Line { points } => assert_eq!(points.len(), 3),
            other => panic!("expected line, got {other:?}"),
        }
    }

    #[test]
    fn wrench_clear_removes_exactly_its_keys() {
        let scene = SceneStateMachine::default();
        scene.create_box("torso", BoxSpec::default()).unwrap();
        let body = Body { vertices: vec![] };
        render_body_wrench(&scene, &body, [0.0, 0.0, 1.0, 10.0, 0.0, 0.0], 0.1, "wrench").unwrap();
        assert_eq!(scene.object_count(), 3);

        assert_eq!(clear_body_wrench(&scene, &body, "wrench"), 2);
        assert_eq!(scene.object_count(), 1);
        assert!(scene.has_object("torso"));
        assert_eq!(clear_body_wrench(&scene, &body, "wrench"), 0);
    }

    #[test]
    fn vertex_lines_track_vertex_count() {
        let scene = SceneStateMachine::default();
        let mut body = Body {
            vertices: vec![(Vec3::ZERO, Vec3::X); 4],
        };
        assert_eq!(render_moving_body_node_vertices(&scene, &body, 0.5, "vel").unwrap(), 4);
        body.vertices.truncate(2);
        render_moving_body_node_vertices(&scene, &body, 0.5, "vel").unwrap();
        assert!(scene.has_object(&vertex_key("vel", "torso", 1)));
        assert!(!scene.has_object(&vertex_key("vel", "torso", 2)));
        assert!(!scene.has_object(&vertex_key("vel", "torso", 3)));
    }

    #[test]
    fn moved_link_emits_position_field() {
        let scene = SceneStateMachine::default();
        render_skeleton(&scene, &Pendulum { angle: 0.0 }, "s", None).unwrap();
        let id = scene.open_session(None).id();
        drain_all(&scene, id);
        render_skeleton(&scene, &Pendulum { angle: 0.5 }, "s", None).unwrap();
        let events = drain_all(&scene, id);
        // link0 sits at the pivot, so only its rotation changes.
        assert!(events.contains(&DiffEvent::UpdateObject {
            key: "s.pendulum.link0.0".into(),
            fields: vec![ObjectField::Rotation(Vec3::new(0.0, 0.5, 0.0))],
        }));
    }
}
