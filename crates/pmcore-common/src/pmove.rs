// pmove.rs -- Player movement code

use crate::cvar::{CvarContext, CvarFlags};
use crate::q_shared::{
    angle_vectors, cross_product, current_direction, dot_product, short2angle, vector_length,
    vector_normalize, vector_scale, Buttons, CPlane, Contents, EntityId, PmFlags, PmType,
    PmoveState, SurfaceFlags, Trace, UserCmd, Vec3, WaterLevel, MASK_CURRENT, MASK_WATER,
    MAXTOUCH, MAX_CLIP_PLANES, PITCH, PMF_ALL_TIMES, VEC3_ORIGIN, YAW,
};
use crate::stuck::{self, StuckResult};

// ============================================================
// Constants
// ============================================================

const STOP_EPSILON: f32 = 0.1;

const GROUND_PROBE: f32 = 0.25;
const MAX_GROUND_UPWARD_SPEED: f32 = 180.0;
const LAND_SPEED: f32 = -200.0;
const HARD_LAND_SPEED: f32 = -400.0;
const LAND_TIME_MS: u16 = 144;
const HARD_LAND_TIME_MS: u16 = 200;

const LADDER_TRACE_DISTANCE: f32 = 1.0;
const LADDER_CLIMB_SPEED: f32 = 200.0;
const LADDER_STRAFE_SPEED: f32 = 150.0;
const LADDER_HORIZONTAL_CAP: f32 = 25.0;
const LADDER_ASCEND_PITCH: f32 = 15.0;

const WATERJUMP_FORWARD_CHECK: f32 = 40.0;
const WATERJUMP_FORWARD_SPEED: f32 = 50.0;
const WATERJUMP_UPWARD_SPEED: f32 = 350.0;
const WATERJUMP_TIME_MS: u16 = 2048;
const WATERJUMP_SIM_STEP: f32 = 0.1;
const WATERJUMP_MAX_STEPS: usize = 50;
const WATERJUMP_DOWN_PROBE: f32 = 2.0;

const WATER_DRIFT_SPEED: f32 = 60.0;
const WATER_SWIM_LIFT: f32 = 10.0;
const WATER_INPUT_DEADZONE: i32 = 10;
const CONVEYOR_SPEED: f32 = 100.0;
const DEAD_FRICTION: f32 = 20.0;

// ============================================================
// Tunables
// ============================================================

/// Movement constants. Server and client must agree on every field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PmoveTunables {
    pub stop_speed: f32,
    pub max_speed: f32,
    pub duck_speed: f32,
    pub accelerate: f32,
    pub air_accelerate: f32,
    pub water_accelerate: f32,
    pub friction: f32,
    pub water_friction: f32,
    pub water_speed: f32,
    pub jump_height: f32,
    pub step_size: f32,
    pub max_bumps: usize,
    pub min_step_normal: f32,
    pub overbounce: f32,
    /// Scale on ladder strafing when not at least waist deep.
    pub ladder_mod: f32,
}

impl Default for PmoveTunables {
    fn default() -> Self {
        Self {
            stop_speed: 100.0,
            max_speed: 300.0,
            duck_speed: 100.0,
            accelerate: 10.0,
            air_accelerate: 1.0,
            water_accelerate: 10.0,
            friction: 6.0,
            water_friction: 1.0,
            water_speed: 400.0,
            jump_height: 270.0,
            step_size: 18.0,
            max_bumps: 4,
            min_step_normal: 0.7,
            overbounce: 1.01,
            ladder_mod: 0.5,
        }
    }
}

impl PmoveTunables {
    fn cvar_table(&self) -> [(&'static str, f32); 15] {
        [
            ("pm_stopspeed", self.stop_speed),
            ("pm_maxspeed", self.max_speed),
            ("pm_duckspeed", self.duck_speed),
            ("pm_accelerate", self.accelerate),
            ("pm_airaccelerate", self.air_accelerate),
            ("pm_wateraccelerate", self.water_accelerate),
            ("pm_friction", self.friction),
            ("pm_waterfriction", self.water_friction),
            ("pm_waterspeed", self.water_speed),
            ("pm_jumpheight", self.jump_height),
            ("pm_stepsize", self.step_size),
            ("pm_maxbumps", self.max_bumps as f32),
            ("pm_minstepnormal", self.min_step_normal),
            ("pm_overbounce", self.overbounce),
            ("pm_laddermod", self.ladder_mod),
        ]
    }

    /// Create the `pm_*` cvars with their default values. Existing cvars
    /// keep their values.
    pub fn register_cvars(cvars: &mut CvarContext) {
        for (name, value) in Self::default().cvar_table() {
            let value = if value == (value as i32) as f32 {
                format!("{}", value as i32)
            } else {
                format!("{}", value)
            };
            cvars.get(name, Some(value.as_str()), CvarFlags::ARCHIVE);
        }
    }

    /// Read tunables from the `pm_*` cvars, using defaults for any that
    /// are not set.
    pub fn from_cvars(cvars: &CvarContext) -> Self {
        let d = Self::default();
        let get = |name: &str, default: f32| cvars.find_var(name).map_or(default, |v| v.value);
        Self {
            stop_speed: get("pm_stopspeed", d.stop_speed),
            max_speed: get("pm_maxspeed", d.max_speed),
            duck_speed: get("pm_duckspeed", d.duck_speed),
            accelerate: get("pm_accelerate", d.accelerate),
            air_accelerate: get("pm_airaccelerate", d.air_accelerate),
            water_accelerate: get("pm_wateraccelerate", d.water_accelerate),
            friction: get("pm_friction", d.friction),
            water_friction: get("pm_waterfriction", d.water_friction),
            water_speed: get("pm_waterspeed", d.water_speed),
            jump_height: get("pm_jumpheight", d.jump_height),
            step_size: get("pm_stepsize", d.step_size),
            max_bumps: get("pm_maxbumps", d.max_bumps as f32).max(1.0) as usize,
            min_step_normal: get("pm_minstepnormal", d.min_step_normal),
            overbounce: get("pm_overbounce", d.overbounce),
            ladder_mod: get("pm_laddermod", d.ladder_mod),
        }
    }
}

// ============================================================
// Callbacks and results
// ============================================================

/// Trace and point contents queries the movement code runs against.
pub trait PmoveCallbacks {
    fn trace(&self, start: &Vec3, mins: &Vec3, maxs: &Vec3, end: &Vec3) -> Trace;
    fn pointcontents(&self, point: &Vec3) -> Contents;
}

/// How the final position was validated.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum StuckOutcome {
    #[default]
    GoodPosition,
    /// The box was embedded and has been moved out.
    Fixed,
    /// No free position was found; the previous origin was restored.
    Reverted,
}

/// Result of one movement tick.
#[derive(Debug, Clone, PartialEq)]
pub struct PmoveOutcome {
    pub state: PmoveState,
    pub viewangles: Vec3,
    pub groundentity: Option<EntityId>,
    pub on_ground: bool,
    pub touchents: Vec<EntityId>,
    pub jumped: bool,
    pub stuck: StuckOutcome,
}

// ============================================================
// Pmove local state
// ============================================================

#[derive(Debug, Clone, Default)]
struct PmLocal {
    origin: Vec3,
    velocity: Vec3,

    forward: Vec3,
    right: Vec3,
    frametime: f32,

    groundsurface: SurfaceFlags,
    groundplane: CPlane,
    groundcontents: Contents,

    previous_origin: Vec3,
}

struct PmoveContext<'a, C: PmoveCallbacks> {
    s: PmoveState,
    cmd: UserCmd,
    tunables: &'a PmoveTunables,
    cb: &'a C,
    pml: PmLocal,

    viewangles: Vec3,
    groundentity: Option<EntityId>,
    on_ground: bool,
    touchents: Vec<EntityId>,
    jumped: bool,
    stuck: StuckOutcome,
}

/// Slide off of the impacting surface.
fn pm_clip_velocity(inv: &Vec3, normal: &Vec3, overbounce: f32) -> Vec3 {
    let backoff = dot_product(inv, normal) * overbounce;
    let mut out = [0.0f32; 3];
    for i in 0..3 {
        out[i] = inv[i] - normal[i] * backoff;
        if out[i] > -STOP_EPSILON && out[i] < STOP_EPSILON {
            out[i] = 0.0;
        }
    }
    out
}

/// Truncate to the 1/8 unit grid.
fn quantize(v: f32) -> f32 {
    ((v * 8.0) as i32) as f32 * 0.125
}

impl<'a, C: PmoveCallbacks> PmoveContext<'a, C> {
    fn new(state: &PmoveState, cmd: &UserCmd, tunables: &'a PmoveTunables, cb: &'a C) -> Self {
        let pml = PmLocal {
            origin: state.origin,
            velocity: state.velocity,
            previous_origin: state.origin,
            frametime: cmd.frametime(),
            ..PmLocal::default()
        };
        Self {
            s: *state,
            cmd: *cmd,
            tunables,
            cb,
            pml,
            viewangles: VEC3_ORIGIN,
            groundentity: None,
            on_ground: state.pm_flags.contains(PmFlags::ON_GROUND),
            touchents: Vec::new(),
            jumped: false,
            stuck: StuckOutcome::GoodPosition,
        }
    }

    fn trace(&self, start: &Vec3, end: &Vec3) -> Trace {
        self.cb.trace(start, &self.s.mins, &self.s.maxs, end)
    }

    fn add_touch(&mut self, trace: &Trace) {
        if let Some(ent) = trace.ent {
            if self.touchents.len() < MAXTOUCH && !self.touchents.contains(&ent) {
                self.touchents.push(ent);
            }
        }
    }

    fn on_ladder(&self) -> bool {
        self.s.pm_flags.contains(PmFlags::ON_LADDER)
    }

    fn clear_ground(&mut self) {
        self.on_ground = false;
        self.groundentity = None;
        self.s.pm_flags.remove(PmFlags::ON_GROUND);
    }

    // --------------------------------------------------------
    // Slide move
    // --------------------------------------------------------

    /// Each intersection will try to step over the obstruction instead of
    /// sliding along it. Returns with the origin and velocity updated.
    fn step_slide_move_inner(&mut self, frametime: f32, has_time: bool) {
        let primal_velocity = self.pml.velocity;
        let mut numplanes: usize = 0;
        let mut planes = [[0.0f32; 3]; MAX_CLIP_PLANES];

        let mut time_left = frametime;

        for _bumpcount in 0..self.tunables.max_bumps {
            let end = [
                self.pml.origin[0] + time_left * self.pml.velocity[0],
                self.pml.origin[1] + time_left * self.pml.velocity[1],
                self.pml.origin[2] + time_left * self.pml.velocity[2],
            ];

            let trace = self.trace(&self.pml.origin, &end);

            if trace.allsolid {
                // entity is trapped in another solid
                self.pml.velocity[2] = 0.0;
                return;
            }

            if trace.fraction > 0.0 {
                // actually covered some distance
                self.pml.origin = trace.endpos;
                numplanes = 0;
            }

            if trace.fraction == 1.0 {
                break; // moved the entire distance
            }

            // save entity for contact
            self.add_touch(&trace);

            time_left -= time_left * trace.fraction;

            // slide along this plane
            if numplanes >= MAX_CLIP_PLANES {
                self.pml.velocity = VEC3_ORIGIN;
                break;
            }

            planes[numplanes] = trace.plane.normal;
            numplanes += 1;

            // modify velocity so it parallels all of the clip planes
            let mut found = false;
            for i in 0..numplanes {
                self.pml.velocity = pm_clip_velocity(&self.pml.velocity, &planes[i], self.tunables.overbounce);
                let ok = (0..numplanes)
                    .all(|j| j == i || dot_product(&self.pml.velocity, &planes[j]) >= 0.0);
                if ok {
                    found = true;
                    break;
                }
            }

            if !found {
                // go along the crease
                if numplanes != 2 {
                    self.pml.velocity = VEC3_ORIGIN;
                    break;
                }
                let dir = cross_product(&planes[0], &planes[1]);
                let d = dot_product(&dir, &self.pml.velocity);
                self.pml.velocity = vector_scale(&dir, d);
            }

            // if velocity is against the original velocity, stop dead
            // to avoid tiny oscillations in sloping corners
            if dot_product(&self.pml.velocity, &primal_velocity) <= 0.0 {
                self.pml.velocity = VEC3_ORIGIN;
                break;
            }
        }

        if has_time {
            self.pml.velocity = primal_velocity;
        }
    }

    fn step_slide_move(&mut self, frametime: f32, has_time: bool) {
        let step_size = self.tunables.step_size;
        let start_o = self.pml.origin;
        let start_v = self.pml.velocity;

        self.step_slide_move_inner(frametime, has_time);

        let down_o = self.pml.origin;
        let down_v = self.pml.velocity;

        let mut up = start_o;
        up[2] += step_size;

        let trace = self.trace(&up, &up);
        if trace.allsolid {
            return; // can't step up
        }

        // try sliding above
        self.pml.origin = up;
        self.pml.velocity = start_v;

        self.step_slide_move_inner(frametime, has_time);

        // push down the final amount
        let mut down = self.pml.origin;
        down[2] -= step_size;
        let trace = self.trace(&self.pml.origin, &down);
        if !trace.allsolid {
            self.pml.origin = trace.endpos;
        }

        let up = self.pml.origin;

        // decide which one went farther
        let down_dist = (down_o[0] - start_o[0]) * (down_o[0] - start_o[0])
            + (down_o[1] - start_o[1]) * (down_o[1] - start_o[1]);
        let up_dist = (up[0] - start_o[0]) * (up[0] - start_o[0])
            + (up[1] - start_o[1]) * (up[1] - start_o[1]);

        if down_dist > up_dist || trace.plane.normal[2] < self.tunables.min_step_normal {
            self.pml.origin = down_o;
            self.pml.velocity = down_v;
            return;
        }
        // if we were walking along a plane, then we need to copy the Z over
        self.pml.velocity[2] = down_v[2];
    }

    // --------------------------------------------------------
    // Friction and acceleration
    // --------------------------------------------------------

    /// Handles both ground friction and water friction
    fn friction(&mut self) {
        let speed = vector_length(&self.pml.velocity);
        if speed < 1.0 {
            self.pml.velocity[0] = 0.0;
            self.pml.velocity[1] = 0.0;
            return;
        }

        let t = self.tunables;
        let ladder = self.on_ladder();
        let mut drop = 0.0f32;

        // apply ground friction
        if (self.on_ground && !self.pml.groundsurface.contains(SurfaceFlags::SLICK)) || ladder {
            let control = if speed < t.stop_speed { t.stop_speed } else { speed };
            drop += control * t.friction * self.pml.frametime;
        }

        // apply water friction
        if self.s.waterlevel != WaterLevel::None && !ladder {
            drop += speed * t.water_friction * self.s.waterlevel.as_f32() * self.pml.frametime;
        }

        // scale the velocity
        let newspeed = (speed - drop).max(0.0) / speed;
        self.pml.velocity = vector_scale(&self.pml.velocity, newspeed);
    }

    fn accelerate(&mut self, wishdir: &Vec3, wishspeed: f32, accel: f32) {
        let currentspeed = dot_product(&self.pml.velocity, wishdir);
        let addspeed = wishspeed - currentspeed;
        if addspeed <= 0.0 {
            return;
        }
        let accelspeed = (accel * self.pml.frametime * wishspeed).min(addspeed);
        for i in 0..3 {
            self.pml.velocity[i] += accelspeed * wishdir[i];
        }
    }

    /// The target speed is capped at 30 but the rate still scales with the
    /// full wish speed.
    fn air_accelerate(&mut self, wishdir: &Vec3, wishspeed: f32, accel: f32) {
        let wishspd = wishspeed.min(30.0);
        let currentspeed = dot_product(&self.pml.velocity, wishdir);
        let addspeed = wishspd - currentspeed;
        if addspeed <= 0.0 {
            return;
        }
        let accelspeed = (accel * wishspeed * self.pml.frametime).min(addspeed);
        for i in 0..3 {
            self.pml.velocity[i] += accelspeed * wishdir[i];
        }
    }

    fn ladder_wish(&self, wishvel: &mut Vec3) {
        let cmd = &self.cmd;
        if cmd.buttons.intersects(Buttons::JUMP | Buttons::CROUCH) {
            let speed = if self.s.waterlevel >= WaterLevel::Waist {
                self.tunables.max_speed
            } else {
                LADDER_CLIMB_SPEED
            };
            wishvel[2] = if cmd.buttons.contains(Buttons::JUMP) { speed } else { -speed };
        } else if cmd.forwardmove != 0 {
            let fm = (cmd.forwardmove as f32).clamp(-LADDER_CLIMB_SPEED, LADDER_CLIMB_SPEED);
            if cmd.forwardmove > 0 {
                // looking down far enough climbs down
                wishvel[2] = if self.viewangles[PITCH] < LADDER_ASCEND_PITCH { fm } else { -fm };
            } else {
                // backing off the ladder in the air only slides down
                if !self.on_ground {
                    wishvel[0] = 0.0;
                    wishvel[1] = 0.0;
                }
                wishvel[2] = fm;
            }
        } else {
            wishvel[2] = 0.0;
        }

        if self.on_ground {
            return;
        }

        if cmd.sidemove == 0 {
            // limit horizontal speed when on a ladder
            wishvel[0] = wishvel[0].clamp(-LADDER_HORIZONTAL_CAP, LADDER_HORIZONTAL_CAP);
            wishvel[1] = wishvel[1].clamp(-LADDER_HORIZONTAL_CAP, LADDER_HORIZONTAL_CAP);
            return;
        }

        let mut side = (cmd.sidemove as f32).clamp(-LADDER_STRAFE_SPEED, LADDER_STRAFE_SPEED);
        if self.s.waterlevel < WaterLevel::Waist {
            side *= self.tunables.ladder_mod;
        }

        // strafe along the ladder surface
        let mut flatforward: Vec3 = [self.pml.forward[0], self.pml.forward[1], 0.0];
        if vector_normalize(&mut flatforward) == 0.0 {
            return;
        }
        let spot = [
            self.pml.origin[0] + LADDER_TRACE_DISTANCE * flatforward[0],
            self.pml.origin[1] + LADDER_TRACE_DISTANCE * flatforward[1],
            self.pml.origin[2],
        ];
        let trace = self.trace(&self.pml.origin, &spot);
        if trace.fraction != 1.0 && !trace.allsolid && trace.contents.contains(Contents::LADDER) {
            let right = cross_product(&trace.plane.normal, &[0.0, 0.0, 1.0]);
            wishvel[0] = -side * right[0];
            wishvel[1] = -side * right[1];
            wishvel[2] += -side * right[2];
        }
    }

    fn add_currents(&mut self, wishvel: &mut Vec3) {
        // account for ladders
        if self.on_ladder() {
            self.ladder_wish(wishvel);
        }

        // add water currents
        if self.s.watertype.intersects(MASK_CURRENT) {
            let v = current_direction(self.s.watertype);
            let mut s = self.tunables.water_speed;
            if self.s.waterlevel == WaterLevel::Feet && self.on_ground {
                s /= 2.0;
            }
            for i in 0..3 {
                wishvel[i] += s * v[i];
            }
        }

        // add conveyor belt velocities
        if self.on_ground {
            let v = current_direction(self.pml.groundcontents);
            for i in 0..3 {
                wishvel[i] += CONVEYOR_SPEED * v[i];
            }
        }
    }

    fn water_move(&mut self) {
        let fm = self.cmd.forwardmove as f32;
        let sm = self.cmd.sidemove as f32;

        let mut wishvel: Vec3 = [0.0; 3];
        for i in 0..3 {
            wishvel[i] = self.pml.forward[i] * fm + self.pml.right[i] * sm;
        }

        let small = |m: i16| (m as i32).abs() < WATER_INPUT_DEADZONE;
        if (self.cmd.upmove as i32).abs() > WATER_INPUT_DEADZONE {
            wishvel[2] += self.cmd.upmove as f32;
        } else if small(self.cmd.forwardmove) && small(self.cmd.sidemove) {
            wishvel[2] -= WATER_DRIFT_SPEED; // drift towards bottom
        } else {
            wishvel[2] += WATER_SWIM_LIFT;
        }

        self.add_currents(&mut wishvel);

        let mut wishdir = wishvel;
        let mut wishspeed = vector_normalize(&mut wishdir);

        if wishspeed > self.tunables.max_speed {
            wishspeed = self.tunables.max_speed;
        }
        wishspeed *= 0.5;

        self.accelerate(&wishdir, wishspeed, self.tunables.water_accelerate);

        self.step_slide_move(self.pml.frametime, self.s.pm_time != 0);
    }

    fn air_move(&mut self) {
        let t = *self.tunables;
        let fmove = self.cmd.forwardmove as f32;
        let smove = self.cmd.sidemove as f32;

        let mut wishvel: Vec3 = [0.0; 3];
        for i in 0..2 {
            wishvel[i] = self.pml.forward[i] * fmove + self.pml.right[i] * smove;
        }

        self.add_currents(&mut wishvel);

        let mut wishdir = wishvel;
        let mut wishspeed = vector_normalize(&mut wishdir);

        // clamp to server defined max speed
        let maxspeed = if self.s.pm_flags.contains(PmFlags::DUCKED) {
            t.duck_speed
        } else {
            t.max_speed
        };
        if wishspeed > maxspeed {
            wishspeed = maxspeed;
        }

        let gravity = self.s.gravity;
        let frametime = self.pml.frametime;
        let has_time = self.s.pm_time != 0;

        if self.on_ladder() {
            self.accelerate(&wishdir, wishspeed, t.accelerate);
            if wishvel[2] == 0.0 {
                if self.pml.velocity[2] > 0.0 {
                    self.pml.velocity[2] = (self.pml.velocity[2] - gravity * frametime).max(0.0);
                } else {
                    self.pml.velocity[2] = (self.pml.velocity[2] + gravity * frametime).min(0.0);
                }
            }
            self.step_slide_move(frametime, has_time);
        } else if self.on_ground {
            // walking on ground
            self.pml.velocity[2] = 0.0;
            self.accelerate(&wishdir, wishspeed, t.accelerate);

            // negative gravity lifts off the ground
            if gravity > 0.0 {
                self.pml.velocity[2] = 0.0;
            } else {
                self.pml.velocity[2] -= gravity * frametime;
            }

            if self.pml.velocity[0] == 0.0 && self.pml.velocity[1] == 0.0 {
                return;
            }
            self.step_slide_move(frametime, has_time);
        } else {
            // not on ground, so little effect on velocity
            if t.air_accelerate > 0.0 {
                self.air_accelerate(&wishdir, wishspeed, t.air_accelerate);
            } else {
                self.accelerate(&wishdir, wishspeed, 1.0);
            }
            // add gravity
            self.pml.velocity[2] -= gravity * frametime;
            self.step_slide_move(frametime, has_time);
        }
    }

    // --------------------------------------------------------
    // Position classification
    // --------------------------------------------------------

    /// Water depth at `origin`, sampled at the feet, the waist and the eyes.
    fn water_level_at(&self, origin: &Vec3) -> (WaterLevel, Contents) {
        let sample2 = (self.s.viewheight - self.s.mins[2]) as i32;
        let sample1 = sample2 / 2;

        let feet = origin[2] + self.s.mins[2];
        let mut point = [origin[0], origin[1], feet + 1.0];
        let cont = self.cb.pointcontents(&point);
        if !cont.intersects(MASK_WATER) {
            return (WaterLevel::None, Contents::empty());
        }

        point[2] = feet + sample1 as f32;
        if !self.cb.pointcontents(&point).intersects(MASK_WATER) {
            return (WaterLevel::Feet, cont);
        }

        point[2] = feet + sample2 as f32;
        if !self.cb.pointcontents(&point).intersects(MASK_WATER) {
            return (WaterLevel::Waist, cont);
        }
        (WaterLevel::Under, cont)
    }

    fn categorize_position(&mut self) {
        // see if standing on something solid
        let mut point = self.pml.origin;
        point[2] -= GROUND_PROBE;

        if self.pml.velocity[2] > MAX_GROUND_UPWARD_SPEED {
            self.clear_ground();
        } else {
            let trace = self.trace(&self.pml.origin, &point);
            self.pml.groundplane = trace.plane;
            self.pml.groundsurface = trace.surface_flags;
            self.pml.groundcontents = trace.contents;

            let walkable = trace.fraction < 1.0 && trace.plane.normal[2] >= self.tunables.min_step_normal;
            if !walkable && !trace.startsolid {
                self.clear_ground();
            } else {
                self.on_ground = true;
                self.groundentity = trace.ent;

                // hitting solid ground will end a waterjump
                if self.s.pm_flags.contains(PmFlags::TIME_WATERJUMP) {
                    self.s.pm_flags.remove(PMF_ALL_TIMES);
                    self.s.pm_time = 0;
                }

                if !self.s.pm_flags.contains(PmFlags::ON_GROUND) {
                    // just hit the ground
                    self.s.pm_flags.insert(PmFlags::ON_GROUND);
                    // don't do landing time if we were just going down a slope
                    if self.pml.velocity[2] < LAND_SPEED {
                        self.s.pm_flags.insert(PmFlags::TIME_LAND);
                        self.s.pm_time = if self.pml.velocity[2] < HARD_LAND_SPEED {
                            HARD_LAND_TIME_MS
                        } else {
                            LAND_TIME_MS
                        };
                    }
                }

                if self.pml.velocity[2] < 0.0 {
                    self.pml.velocity[2] = 0.0;
                }
            }

            if trace.fraction < 1.0 || trace.startsolid {
                self.add_touch(&trace);
            }
        }

        // get waterlevel, accounting for ducking
        let (waterlevel, watertype) = self.water_level_at(&self.pml.origin);
        self.s.waterlevel = waterlevel;
        self.s.watertype = watertype;
    }

    fn check_jump(&mut self) {
        if self.s.pm_flags.contains(PmFlags::TIME_LAND) {
            // hasn't been long enough since landing to jump again
            return;
        }

        if !self.cmd.buttons.contains(Buttons::JUMP) {
            // not holding jump
            self.s.pm_flags.remove(PmFlags::JUMP_HELD);
            return;
        }

        // must wait for jump to be released
        if self.s.pm_flags.contains(PmFlags::JUMP_HELD) {
            return;
        }

        if self.s.pm_type.ignores_input() {
            return;
        }

        if self.s.waterlevel >= WaterLevel::Waist {
            // swimming, not jumping
            self.clear_ground();

            if self.pml.velocity[2] <= -300.0 {
                return;
            }

            self.pml.velocity[2] = if self.s.watertype.contains(Contents::WATER) {
                100.0
            } else if self.s.watertype.contains(Contents::SLIME) {
                80.0
            } else {
                50.0
            };
            return;
        }

        if !self.on_ground {
            return; // in air, so no effect
        }

        self.s.pm_flags.insert(PmFlags::JUMP_HELD);
        self.jumped = true;
        self.clear_ground();

        let jump_height = self.tunables.jump_height;
        self.pml.velocity[2] += jump_height;
        if self.pml.velocity[2] < jump_height {
            self.pml.velocity[2] = jump_height;
        }
    }

    fn check_special_movement(&mut self) {
        self.s.pm_flags.remove(PmFlags::ON_LADDER);

        if self.s.pm_time != 0 {
            return;
        }

        let mut flatforward: Vec3 = [self.pml.forward[0], self.pml.forward[1], 0.0];
        if vector_normalize(&mut flatforward) == 0.0 {
            return;
        }

        // check for ladder
        if self.s.waterlevel < WaterLevel::Waist {
            let spot = [
                self.pml.origin[0] + LADDER_TRACE_DISTANCE * flatforward[0],
                self.pml.origin[1] + LADDER_TRACE_DISTANCE * flatforward[1],
                self.pml.origin[2],
            ];
            let trace = self.trace(&self.pml.origin, &spot);
            if trace.fraction < 1.0 && trace.contents.contains(Contents::LADDER) {
                self.s.pm_flags.insert(PmFlags::ON_LADDER);
            }
        }

        if self.s.gravity == 0.0 {
            return;
        }
        // check for water jump
        if !self.cmd.buttons.contains(Buttons::JUMP) && self.cmd.forwardmove <= 0 {
            return;
        }
        if self.s.waterlevel != WaterLevel::Waist || self.s.watertype.contains(Contents::NO_WATERJUMP) {
            return;
        }

        let check = [
            self.pml.origin[0] + WATERJUMP_FORWARD_CHECK * flatforward[0],
            self.pml.origin[1] + WATERJUMP_FORWARD_CHECK * flatforward[1],
            self.pml.origin[2],
        ];
        let trace = self.trace(&self.pml.origin, &check);
        if trace.fraction == 1.0 || trace.plane.normal[2] >= self.tunables.min_step_normal {
            return;
        }

        let jump_velocity = [
            flatforward[0] * WATERJUMP_FORWARD_SPEED,
            flatforward[1] * WATERJUMP_FORWARD_SPEED,
            WATERJUMP_UPWARD_SPEED,
        ];
        if let Some(landing) = self.simulate_water_jump(&jump_velocity) {
            let (landing_level, _) = self.water_level_at(&landing);
            if landing_level >= WaterLevel::Waist {
                return;
            }

            // jump out of water
            self.pml.velocity = jump_velocity;
            self.s.pm_flags.insert(PmFlags::TIME_WATERJUMP);
            self.s.pm_time = WATERJUMP_TIME_MS;
        }
    }

    /// Fly the jump forward in coarse steps and return where it lands, if
    /// it lands on walkable ground above the starting height.
    fn simulate_water_jump(&mut self, jump_velocity: &Vec3) -> Option<Vec3> {
        let gravity = self.s.gravity;
        let steps = ((10.0 * (800.0 / gravity)).floor().max(0.0) as usize).min(WATERJUMP_MAX_STEPS);

        let saved_origin = self.pml.origin;
        let saved_velocity = self.pml.velocity;
        let saved_touch = self.touchents.len();

        self.pml.velocity = *jump_velocity;
        let mut has_time = true;
        for _ in 0..steps {
            self.pml.velocity[2] -= gravity * WATERJUMP_SIM_STEP;
            if self.pml.velocity[2] < 0.0 {
                has_time = false;
            }
            self.step_slide_move(WATERJUMP_SIM_STEP, has_time);
        }
        let sim_origin = self.pml.origin;

        self.pml.origin = saved_origin;
        self.pml.velocity = saved_velocity;
        self.touchents.truncate(saved_touch);

        let mut down = sim_origin;
        down[2] -= WATERJUMP_DOWN_PROBE;
        let trace = self.trace(&sim_origin, &down);
        if trace.fraction == 1.0
            || trace.plane.normal[2] < self.tunables.min_step_normal
            || trace.endpos[2] < saved_origin[2]
        {
            return None;
        }

        // a plain step up does not need a water jump
        if self.on_ground && (saved_origin[2] - trace.endpos[2]).abs() <= self.tunables.step_size {
            return None;
        }
        Some(trace.endpos)
    }

    fn fly_move(&mut self, doclip: bool) {
        let t = *self.tunables;
        self.s.viewheight = 22.0;

        // friction
        let speed = vector_length(&self.pml.velocity);
        if speed < 1.0 {
            self.pml.velocity = VEC3_ORIGIN;
        } else {
            let friction = t.friction * 1.5; // extra friction
            let control = if speed < t.stop_speed { t.stop_speed } else { speed };
            let drop = control * friction * self.pml.frametime;
            let newspeed = (speed - drop).max(0.0) / speed;
            self.pml.velocity = vector_scale(&self.pml.velocity, newspeed);
        }

        // accelerate
        let fmove = self.cmd.forwardmove as f32;
        let smove = self.cmd.sidemove as f32;

        vector_normalize(&mut self.pml.forward);
        vector_normalize(&mut self.pml.right);

        let mut wishvel: Vec3 = [0.0; 3];
        for i in 0..3 {
            wishvel[i] = self.pml.forward[i] * fmove + self.pml.right[i] * smove;
        }
        wishvel[2] += self.cmd.upmove as f32;
        if self.cmd.buttons.contains(Buttons::JUMP) {
            wishvel[2] += t.water_speed * 0.5;
        }
        if self.cmd.buttons.contains(Buttons::CROUCH) {
            wishvel[2] -= t.water_speed * 0.5;
        }

        let mut wishdir = wishvel;
        let mut wishspeed = vector_normalize(&mut wishdir);

        // clamp to server defined max speed
        if wishspeed > t.max_speed {
            wishspeed = t.max_speed;
        }
        wishspeed *= 2.0;

        self.accelerate(&wishdir, wishspeed, t.accelerate);

        if doclip {
            self.step_slide_move_inner(self.pml.frametime, self.s.pm_time != 0);
        } else {
            // move
            for i in 0..3 {
                self.pml.origin[i] += self.pml.frametime * self.pml.velocity[i];
            }
        }
    }

    /// Sets mins, maxs, and viewheight
    fn check_duck(&mut self) {
        self.s.mins[0] = -16.0;
        self.s.mins[1] = -16.0;
        self.s.maxs[0] = 16.0;
        self.s.maxs[1] = 16.0;

        if self.s.pm_type == PmType::Gib {
            self.s.mins[2] = 0.0;
            self.s.maxs[2] = 16.0;
            self.s.viewheight = 8.0;
            return;
        }

        self.s.mins[2] = -24.0;

        let wants_crouch = self.cmd.buttons.contains(Buttons::CROUCH)
            && (self.on_ground || self.s.waterlevel <= WaterLevel::Feet)
            && !self.on_ladder();

        if self.s.pm_type == PmType::Dead || wants_crouch {
            self.s.pm_flags.insert(PmFlags::DUCKED);
        } else if self.s.pm_flags.contains(PmFlags::DUCKED) {
            // try to stand up
            self.s.maxs[2] = 32.0;
            let trace = self.trace(&self.pml.origin, &self.pml.origin);
            if !trace.allsolid {
                self.s.pm_flags.remove(PmFlags::DUCKED);
            }
        }

        if self.s.pm_flags.contains(PmFlags::DUCKED) {
            self.s.maxs[2] = 4.0;
            self.s.viewheight = -2.0;
        } else {
            self.s.maxs[2] = 32.0;
            self.s.viewheight = 22.0;
        }
    }

    fn dead_move(&mut self) {
        if !self.on_ground {
            return;
        }

        // extra friction
        let forward = vector_length(&self.pml.velocity) - DEAD_FRICTION;
        if forward <= 0.0 {
            self.pml.velocity = VEC3_ORIGIN;
        } else {
            vector_normalize(&mut self.pml.velocity);
            self.pml.velocity = vector_scale(&self.pml.velocity, forward);
        }
    }

    // --------------------------------------------------------
    // Position validation
    // --------------------------------------------------------

    fn good_position(&self, origin: &Vec3) -> bool {
        if matches!(self.s.pm_type, PmType::Spectator | PmType::NoClip) {
            return true;
        }
        !self.trace(origin, origin).allsolid
    }

    /// Try the eight 1/8 grid points around `origin`, nearest first.
    fn snap_to_grid(&self, origin: &Vec3) -> Option<Vec3> {
        const JITTERBITS: [usize; 8] = [0, 4, 1, 2, 3, 5, 6, 7];

        let mut sign = [0.0f32; 3];
        let mut base = [0.0f32; 3];
        for i in 0..3 {
            sign[i] = if origin[i] >= 0.0 { 1.0 } else { -1.0 };
            base[i] = quantize(origin[i]);
            if base[i] == origin[i] {
                sign[i] = 0.0;
            }
        }

        // try all combinations
        JITTERBITS.into_iter().find_map(|bits| {
            let mut pos = base;
            for i in 0..3 {
                if bits & (1 << i) != 0 {
                    pos[i] += sign[i] * 0.125;
                }
            }
            self.good_position(&pos).then_some(pos)
        })
    }

    /// On exit, the origin will have a value that is pre-quantized to the
    /// 1/8 grid and is a valid position, or the previous origin.
    fn snap_position(&mut self) {
        // snap velocity to eighths
        for i in 0..3 {
            self.s.velocity[i] = quantize(self.pml.velocity[i]);
        }

        if let Some(pos) = self.snap_to_grid(&self.pml.origin) {
            self.s.origin = pos;
            return;
        }

        // embedded wherever we snap: nudge out, then search nearby
        let cb = self.cb;
        let trace = |s: &Vec3, mn: &Vec3, mx: &Vec3, e: &Vec3| cb.trace(s, mn, mx, e);
        let nudged = match stuck::fix_stuck_object(&self.pml.origin, &self.s.mins, &self.s.maxs, trace) {
            StuckResult::Fixed(pos) => self.snap_to_grid(&pos),
            // free off the grid only; the grid search below stays on it
            StuckResult::GoodPosition | StuckResult::NoGoodPosition => None,
        };
        let base = self.pml.origin.map(quantize);
        let fixed = nudged.or_else(|| stuck::grid_search(&base, &self.s.mins, &self.s.maxs, 1.0, trace));

        match fixed {
            Some(pos) => {
                self.s.origin = pos;
                self.stuck = StuckOutcome::Fixed;
            }
            None => {
                // go back to the last position
                log::debug!("pmove: stuck at {:?}, reverting to {:?}", self.pml.origin, self.pml.previous_origin);
                self.s.origin = self.pml.previous_origin;
                self.stuck = StuckOutcome::Reverted;
            }
        }
    }

    fn initial_snap_position(&mut self) {
        let cb = self.cb;
        let trace = |s: &Vec3, mn: &Vec3, mx: &Vec3, e: &Vec3| cb.trace(s, mn, mx, e);
        match stuck::grid_search(&self.s.origin, &self.s.mins, &self.s.maxs, 0.125, trace) {
            Some(pos) => {
                self.s.origin = pos;
                self.pml.origin = pos;
                self.pml.previous_origin = pos;
            }
            None => log::debug!("pmove: bad initial snap position at {:?}", self.s.origin),
        }
    }

    fn clamp_angles(&mut self) {
        if self.s.pm_flags.contains(PmFlags::TIME_TELEPORT) {
            self.viewangles[YAW] =
                short2angle(self.cmd.angles[YAW].wrapping_add(self.s.delta_angles[YAW]));
            self.viewangles[PITCH] = 0.0;
            self.viewangles[2] = 0.0;
        } else {
            // circularly clamp the angles with deltas
            for i in 0..3 {
                let temp = self.cmd.angles[i].wrapping_add(self.s.delta_angles[i]);
                self.viewangles[i] = short2angle(temp);
            }

            // don't let the player look up or down more than 90 degrees
            let pitch = &mut self.viewangles[PITCH];
            if *pitch > 89.0 && *pitch < 180.0 {
                *pitch = 89.0;
            } else if *pitch < 271.0 && *pitch >= 180.0 {
                *pitch = 271.0;
            }
            if *pitch > 180.0 {
                *pitch -= 360.0;
            }
        }
        let (forward, right, _) = angle_vectors(&self.viewangles);
        self.pml.forward = forward;
        self.pml.right = right;
    }

    // --------------------------------------------------------
    // Main execution
    // --------------------------------------------------------

    fn execute(&mut self) {
        self.clamp_angles();

        if matches!(self.s.pm_type, PmType::Spectator | PmType::NoClip) {
            self.fly_move(self.s.pm_type == PmType::Spectator);
            self.snap_position();
            return;
        }

        if self.s.pm_type.ignores_input() {
            self.cmd.forwardmove = 0;
            self.cmd.sidemove = 0;
            self.cmd.upmove = 0;
        }

        if self.s.pm_type == PmType::Freeze {
            return; // no movement at all
        }

        // set mins, maxs, and viewheight
        self.check_duck();

        if self.s.snapinitial {
            self.initial_snap_position();
            self.s.snapinitial = false;
        }

        // set groundentity, watertype, and waterlevel
        self.categorize_position();

        if self.s.pm_type == PmType::Dead {
            self.dead_move();
        }

        self.check_special_movement();

        // drop timing counter
        if self.s.pm_time != 0 {
            let msec = (self.cmd.msec as u16).max(1);
            if msec >= self.s.pm_time {
                self.s.pm_flags.remove(PMF_ALL_TIMES);
                self.s.pm_time = 0;
            } else {
                self.s.pm_time -= msec;
            }
        }

        if self.s.pm_flags.contains(PmFlags::TIME_TELEPORT) {
            // teleport pause stays exactly in place
        } else if self.s.pm_flags.contains(PmFlags::TIME_WATERJUMP) {
            // waterjump has no control, but falls
            self.pml.velocity[2] -= self.s.gravity * self.pml.frametime;
            if self.pml.velocity[2] < 0.0 {
                // cancel as soon as we are falling down again
                self.s.pm_flags.remove(PMF_ALL_TIMES);
                self.s.pm_time = 0;
            }

            self.step_slide_move(self.pml.frametime, self.s.pm_time != 0);
        } else {
            self.check_jump();

            self.friction();

            if self.s.waterlevel >= WaterLevel::Waist {
                self.water_move();
            } else {
                let mut angles = self.viewangles;
                angles[PITCH] /= 3.0;
                let (forward, right, _) = angle_vectors(&angles);
                self.pml.forward = forward;
                self.pml.right = right;

                self.air_move();
            }
        }

        // set groundentity, watertype, and waterlevel for final spot
        self.categorize_position();

        self.snap_position();
    }

    fn finish(self) -> PmoveOutcome {
        PmoveOutcome {
            state: self.s,
            viewangles: self.viewangles,
            groundentity: self.groundentity,
            on_ground: self.on_ground,
            touchents: self.touchents,
            jumped: self.jumped,
            stuck: self.stuck,
        }
    }
}

// ============================================================
// Public API
// ============================================================

/// Run one tick of player movement. Used by both the server and the
/// predicting client; the result depends only on the arguments.
pub fn pmove(
    state: &PmoveState,
    cmd: &UserCmd,
    tunables: &PmoveTunables,
    callbacks: &impl PmoveCallbacks,
) -> PmoveOutcome {
    let mut ctx = PmoveContext::new(state, cmd, tunables, callbacks);
    ctx.execute();
    ctx.finish()
}

// ============================================================
// Unit tests
// ============================================================
