// stuck.rs -- Recovery of a bounding box embedded in solid geometry

use crate::q_shared::{dot_product, vector_subtract, Trace, Vec3};

/// What happened while freeing a box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StuckResult {
    /// The box was not embedded.
    GoodPosition,
    /// The box was moved to a free position.
    Fixed(Vec3),
    /// Every probe failed; the caller keeps its fallback.
    NoGoodPosition,
}

/// One face of the box: its outward normal and the flat probe covering it.
/// Bound codes pick `mins` (-1), `maxs` (1) or zero per axis.
struct SideCheck {
    normal: [i8; 3],
    mins: [i8; 3],
    maxs: [i8; 3],
}

// Opposite faces are adjacent, so `i ^ 1` is the other side.
const SIDE_CHECKS: [SideCheck; 6] = [
    SideCheck { normal: [0, 0, 1], mins: [-1, -1, 0], maxs: [1, 1, 0] },
    SideCheck { normal: [0, 0, -1], mins: [-1, -1, 0], maxs: [1, 1, 0] },
    SideCheck { normal: [1, 0, 0], mins: [0, -1, -1], maxs: [0, 1, 1] },
    SideCheck { normal: [-1, 0, 0], mins: [0, -1, -1], maxs: [0, 1, 1] },
    SideCheck { normal: [0, 1, 0], mins: [-1, 0, -1], maxs: [1, 0, 1] },
    SideCheck { normal: [0, -1, 0], mins: [-1, 0, -1], maxs: [1, 0, 1] },
];

/// Distance pushed past the opposite face so the result is not touching.
const FACE_CLEARANCE: f32 = 0.125;

fn bound_value(code: i8, axis: usize, mins: &Vec3, maxs: &Vec3) -> f32 {
    match code {
        -1 => mins[axis],
        1 => maxs[axis],
        _ => 0.0,
    }
}

fn side_start(origin: &Vec3, side: &SideCheck, mins: &Vec3, maxs: &Vec3) -> Vec3 {
    let mut start = *origin;
    for axis in 0..3 {
        if side.normal[axis] < 0 {
            start[axis] += mins[axis];
        } else if side.normal[axis] > 0 {
            start[axis] += maxs[axis];
        }
    }
    start
}

/// Probe each face of the box, sweep the free ones across to the opposite
/// face and keep the smallest displacement that yields a free position.
pub fn fix_stuck_object<F>(origin: &Vec3, mins: &Vec3, maxs: &Vec3, trace: F) -> StuckResult
where
    F: Fn(&Vec3, &Vec3, &Vec3, &Vec3) -> Trace,
{
    if !trace(origin, mins, maxs, origin).startsolid {
        return StuckResult::GoodPosition;
    }

    let mut best: Option<(f32, Vec3)> = None;

    for (i, side) in SIDE_CHECKS.iter().enumerate() {
        let mut local_mins: Vec3 = [0.0; 3];
        let mut local_maxs: Vec3 = [0.0; 3];
        for axis in 0..3 {
            local_mins[axis] = bound_value(side.mins[axis], axis, mins, maxs);
            local_maxs[axis] = bound_value(side.maxs[axis], axis, mins, maxs);
        }

        let mut start = side_start(origin, side, mins, maxs);
        let mut tr = trace(&start, &local_mins, &local_maxs, &start);

        // nudge the probe one unit along the face when it starts embedded
        let mut nudge: Option<(usize, f32)> = None;
        if tr.startsolid {
            'axes: for axis in (0..3).filter(|&a| side.normal[a] == 0) {
                for dir in [1.0f32, -1.0] {
                    let mut probe = start;
                    probe[axis] += dir;
                    tr = trace(&probe, &local_mins, &local_maxs, &probe);
                    if !tr.startsolid {
                        start = probe;
                        nudge = Some((axis, dir));
                        break 'axes;
                    }
                }
            }
        }
        if tr.startsolid {
            continue;
        }

        let mut opposite = side_start(origin, &SIDE_CHECKS[i ^ 1], mins, maxs);
        if let Some((axis, dir)) = nudge {
            opposite[axis] += dir;
        }

        let tr = trace(&start, &local_mins, &local_maxs, &opposite);
        if tr.startsolid {
            continue;
        }

        let mut end = tr.endpos;
        for axis in 0..3 {
            end[axis] += side.normal[axis] as f32 * FACE_CLEARANCE;
        }
        let delta = vector_subtract(&end, &opposite);
        let mut new_origin = [origin[0] + delta[0], origin[1] + delta[1], origin[2] + delta[2]];
        if let Some((axis, dir)) = nudge {
            new_origin[axis] += dir;
        }

        if trace(&new_origin, mins, maxs, &new_origin).startsolid {
            continue;
        }

        let distance = dot_product(&delta, &delta);
        if best.map_or(true, |(d, _)| distance < d) {
            best = Some((distance, new_origin));
        }
    }

    match best {
        Some((_, pos)) => StuckResult::Fixed(pos),
        None => StuckResult::NoGoodPosition,
    }
}

/// Try the 27 offsets `{0, -step, +step}` on each axis, z outermost, and
/// return the first position that is not embedded.
pub fn grid_search<F>(origin: &Vec3, mins: &Vec3, maxs: &Vec3, step: f32, trace: F) -> Option<Vec3>
where
    F: Fn(&Vec3, &Vec3, &Vec3, &Vec3) -> Trace,
{
    const OFFSET: [f32; 3] = [0.0, -1.0, 1.0];

    for oz in OFFSET {
        for oy in OFFSET {
            for ox in OFFSET {
                let pos = [
                    origin[0] + ox * step,
                    origin[1] + oy * step,
                    origin[2] + oz * step,
                ];
                if !trace(&pos, mins, maxs, &pos).allsolid {
                    return Some(pos);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmodel::CollisionModel;
    use crate::q_shared::{Contents, MASK_PLAYERSOLID};

    const MINS: Vec3 = [-16.0, -16.0, -24.0];
    const MAXS: Vec3 = [16.0, 16.0, 32.0];

    fn floor_model() -> CollisionModel {
        CollisionModel::from_boxes(&[([-512.0, -512.0, -64.0], [512.0, 512.0, 0.0], Contents::SOLID)]).unwrap()
    }

    fn tracer(cm: &CollisionModel) -> impl Fn(&Vec3, &Vec3, &Vec3, &Vec3) -> Trace + '_ {
        move |start: &Vec3, mins: &Vec3, maxs: &Vec3, end: &Vec3| {
            cm.box_trace(start, end, mins, maxs, -1, MASK_PLAYERSOLID)
        }
    }

    #[test]
    fn test_free_box_is_good_position() {
        let cm = floor_model();
        let result = fix_stuck_object(&[0.0, 0.0, 40.0], &MINS, &MAXS, tracer(&cm));
        assert_eq!(result, StuckResult::GoodPosition);
    }

    #[test]
    fn test_box_sunk_into_floor_is_lifted() {
        let cm = floor_model();
        // feet 4 units below the floor surface
        let result = fix_stuck_object(&[0.0, 0.0, 20.0], &MINS, &MAXS, tracer(&cm));
        let StuckResult::Fixed(pos) = result else {
            panic!("expected a fix, got {:?}", result);
        };
        assert_eq!((pos[0], pos[1]), (0.0, 0.0), "only moved vertically: {:?}", pos);
        assert!(pos[2] > 24.0 && pos[2] < 24.5, "lifted just clear of the floor: {:?}", pos);
        assert!(!tracer(&cm)(&pos, &MINS, &MAXS, &pos).startsolid);
    }

    #[test]
    fn test_fully_enclosed_box_has_no_fix() {
        let cm = CollisionModel::from_boxes(&[([-1024.0; 3], [1024.0; 3], Contents::SOLID)]).unwrap();
        let result = fix_stuck_object(&[0.0; 3], &MINS, &MAXS, tracer(&cm));
        assert_eq!(result, StuckResult::NoGoodPosition);
    }

    #[test]
    fn test_grid_search_steps_up_one_unit() {
        let cm = floor_model();
        let pos = grid_search(&[0.0, 0.0, 23.5], &MINS, &MAXS, 1.0, tracer(&cm));
        assert_eq!(pos, Some([0.0, 0.0, 24.5]));
    }

    #[test]
    fn test_grid_search_gives_up() {
        let cm = floor_model();
        assert_eq!(grid_search(&[0.0, 0.0, 10.0], &MINS, &MAXS, 1.0, tracer(&cm)), None);
    }
}
