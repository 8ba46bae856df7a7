// q_shared.rs -- Shared math, contents flags, trace and movement types

pub type Vec3 = [f32; 3];

pub const VEC3_ORIGIN: Vec3 = [0.0, 0.0, 0.0];

// angle indexes
pub const PITCH: usize = 0; // up / down
pub const YAW: usize = 1; // left / right
pub const ROLL: usize = 2; // fall over

pub const MAX_CLIP_PLANES: usize = 5;
pub const MAXTOUCH: usize = 32;

/// Distance a trace stops short of the surface it hits.
pub const DIST_EPSILON: f32 = 0.03125;

// ============================================================
// Contents flags
// ============================================================

bitflags::bitflags! {
    /// Classification of a volume. Brushes, leaves and linked entities
    /// carry these; traces take a mask of them.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Contents: u32 {
        const SOLID         = 1 << 0;
        const WINDOW        = 1 << 1;
        const AUX           = 1 << 2;
        const LAVA          = 1 << 3;
        const SLIME         = 1 << 4;
        const WATER         = 1 << 5;
        const MIST          = 1 << 6;
        const TRIGGER       = 1 << 12;
        const NO_WATERJUMP  = 1 << 13;
        const AREAPORTAL    = 1 << 15;
        const PLAYERCLIP    = 1 << 16;
        const MONSTERCLIP   = 1 << 17;
        const CURRENT_0     = 1 << 18;
        const CURRENT_90    = 1 << 19;
        const CURRENT_180   = 1 << 20;
        const CURRENT_270   = 1 << 21;
        const CURRENT_UP    = 1 << 22;
        const CURRENT_DOWN  = 1 << 23;
        const ORIGIN        = 1 << 24;
        const MONSTER       = 1 << 25;
        const DEADMONSTER   = 1 << 26;
        const DETAIL        = 1 << 27;
        const TRANSLUCENT   = 1 << 28;
        const LADDER        = 1 << 29;
        const PLAYER        = 1 << 30;
        const PROJECTILE    = 1 << 31;
    }
}

pub const MASK_ALL: Contents = Contents::all();
pub const MASK_SOLID: Contents = Contents::SOLID.union(Contents::WINDOW);
pub const MASK_PLAYERSOLID: Contents = Contents::SOLID
    .union(Contents::PLAYERCLIP)
    .union(Contents::WINDOW)
    .union(Contents::MONSTER)
    .union(Contents::PLAYER);
pub const MASK_DEADSOLID: Contents = Contents::SOLID
    .union(Contents::PLAYERCLIP)
    .union(Contents::WINDOW);
pub const MASK_MONSTERSOLID: Contents = Contents::SOLID
    .union(Contents::MONSTERCLIP)
    .union(Contents::WINDOW)
    .union(Contents::MONSTER)
    .union(Contents::PLAYER);
pub const MASK_WATER: Contents = Contents::WATER
    .union(Contents::LAVA)
    .union(Contents::SLIME);
pub const MASK_OPAQUE: Contents = Contents::SOLID
    .union(Contents::SLIME)
    .union(Contents::LAVA);
pub const MASK_SHOT: Contents = Contents::SOLID
    .union(Contents::MONSTER)
    .union(Contents::PLAYER)
    .union(Contents::WINDOW)
    .union(Contents::DEADMONSTER);
pub const MASK_CURRENT: Contents = Contents::CURRENT_0
    .union(Contents::CURRENT_90)
    .union(Contents::CURRENT_180)
    .union(Contents::CURRENT_270)
    .union(Contents::CURRENT_UP)
    .union(Contents::CURRENT_DOWN);

/// Unit direction a set of current flags pushes toward. Opposing flags cancel.
pub fn current_direction(contents: Contents) -> Vec3 {
    let mut v: Vec3 = [0.0; 3];
    if contents.contains(Contents::CURRENT_0) {
        v[0] += 1.0;
    }
    if contents.contains(Contents::CURRENT_90) {
        v[1] += 1.0;
    }
    if contents.contains(Contents::CURRENT_180) {
        v[0] -= 1.0;
    }
    if contents.contains(Contents::CURRENT_270) {
        v[1] -= 1.0;
    }
    if contents.contains(Contents::CURRENT_UP) {
        v[2] += 1.0;
    }
    if contents.contains(Contents::CURRENT_DOWN) {
        v[2] -= 1.0;
    }
    v
}

// ============================================================
// Surface flags
// ============================================================

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct SurfaceFlags: u32 {
        const LIGHT    = 0x1;
        const SLICK    = 0x2; // effects game physics
        const SKY      = 0x4;
        const WARP     = 0x8;
        const TRANS33  = 0x10;
        const TRANS66  = 0x20;
        const FLOWING  = 0x40;
        const NODRAW   = 0x80;
    }
}

// ============================================================
// Planes
// ============================================================

pub const PLANE_X: u8 = 0;
pub const PLANE_Y: u8 = 1;
pub const PLANE_Z: u8 = 2;
pub const PLANE_NON_AXIAL: u8 = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CPlane {
    pub normal: Vec3,
    pub dist: f32,
    pub plane_type: u8, // for fast side tests
    pub signbits: u8,   // signx + (signy<<1) + (signz<<2)
}

impl CPlane {
    /// Build a plane and derive its axial type and sign bits.
    pub fn new(normal: Vec3, dist: f32) -> Self {
        Self {
            normal,
            dist,
            plane_type: plane_type_for_normal(&normal),
            signbits: signbits_for_plane(&normal),
        }
    }
}

pub fn plane_type_for_normal(normal: &Vec3) -> u8 {
    if normal[0] == 1.0 || normal[0] == -1.0 {
        return PLANE_X;
    }
    if normal[1] == 1.0 || normal[1] == -1.0 {
        return PLANE_Y;
    }
    if normal[2] == 1.0 || normal[2] == -1.0 {
        return PLANE_Z;
    }
    PLANE_NON_AXIAL
}

pub fn signbits_for_plane(normal: &Vec3) -> u8 {
    let mut bits = 0u8;
    for (j, n) in normal.iter().enumerate() {
        if *n < 0.0 {
            bits |= 1 << j;
        }
    }
    bits
}

/// Returns 1 if the box is entirely in front of the plane, 2 if entirely
/// behind it, 3 if it straddles.
pub fn box_on_plane_side(emins: &Vec3, emaxs: &Vec3, p: &CPlane) -> i32 {
    // fast axial cases
    if p.plane_type < PLANE_NON_AXIAL {
        let t = p.plane_type as usize;
        if p.dist <= emins[t] {
            return 1;
        }
        if p.dist >= emaxs[t] {
            return 2;
        }
        return 3;
    }

    // general case: the sign bits pick the nearest and farthest corners
    let mut near: Vec3 = [0.0; 3];
    let mut far: Vec3 = [0.0; 3];
    for j in 0..3 {
        if p.signbits & (1 << j) != 0 {
            far[j] = emins[j];
            near[j] = emaxs[j];
        } else {
            far[j] = emaxs[j];
            near[j] = emins[j];
        }
    }
    let dist1 = dot_product(&p.normal, &far);
    let dist2 = dot_product(&p.normal, &near);

    let mut sides = 0;
    if dist1 >= p.dist {
        sides = 1;
    }
    if dist2 < p.dist {
        sides |= 2;
    }
    sides
}

// ============================================================
// Entity references and trace results
// ============================================================

/// Opaque handle for a linked entity. The world itself has no id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub u32);

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Result of sweeping a box along a segment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trace {
    pub allsolid: bool,   // if true, plane is not valid
    pub startsolid: bool, // if true, the initial point was in a solid area
    pub fraction: f32,    // time completed, 1.0 = didn't hit anything
    pub endpos: Vec3,     // final position
    pub plane: CPlane,    // surface normal at impact
    pub surface_flags: SurfaceFlags,
    pub contents: Contents, // contents on other side of surface hit
    pub ent: Option<EntityId>, // None for world geometry
}

impl Default for Trace {
    fn default() -> Self {
        Self {
            allsolid: false,
            startsolid: false,
            fraction: 1.0,
            endpos: [0.0; 3],
            plane: CPlane::default(),
            surface_flags: SurfaceFlags::empty(),
            contents: Contents::empty(),
            ent: None,
        }
    }
}

impl Trace {
    /// An unobstructed trace ending at `end`.
    pub fn clear(end: &Vec3) -> Self {
        Self {
            endpos: *end,
            ..Self::default()
        }
    }
}

// ============================================================
// Player movement types
// ============================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PmType {
    #[default]
    Normal,
    Spectator, // flies, clips against the world
    NoClip,    // flies through everything
    // no acceleration or turning
    Dead,
    Gib, // different bounding box
    Freeze,
}

impl PmType {
    /// Dead, gibbed and frozen players ignore movement input.
    pub fn ignores_input(self) -> bool {
        matches!(self, PmType::Dead | PmType::Gib | PmType::Freeze)
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct PmFlags: u16 {
        const DUCKED         = 1 << 0;
        const JUMP_HELD      = 1 << 1;
        const ON_GROUND      = 1 << 2;
        const TIME_WATERJUMP = 1 << 3; // pm_time is waterjump
        const TIME_LAND      = 1 << 4; // pm_time is time before rejump
        const TIME_TELEPORT  = 1 << 5; // pm_time is non-moving time
        const NO_PREDICTION  = 1 << 6; // temporarily disables prediction
        const ON_LADDER      = 1 << 7;
    }
}

pub const PMF_ALL_TIMES: PmFlags = PmFlags::TIME_WATERJUMP
    .union(PmFlags::TIME_LAND)
    .union(PmFlags::TIME_TELEPORT);

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Buttons: u8 {
        const ATTACK = 1 << 0;
        const USE    = 1 << 1;
        const JUMP   = 1 << 2;
        const CROUCH = 1 << 3;
        const ANY    = 1 << 7; // any key whatsoever
    }
}

/// Depth of submersion, sampled at the feet, waist and eyes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum WaterLevel {
    #[default]
    None = 0,
    Feet = 1,
    Waist = 2,
    Under = 3,
}

impl WaterLevel {
    pub fn as_f32(self) -> f32 {
        self as u8 as f32
    }
}

/// Persistent per-player movement state. Everything the integrator needs
/// to continue from one tick to the next.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PmoveState {
    pub pm_type: PmType,
    pub origin: Vec3,
    pub velocity: Vec3,
    pub pm_flags: PmFlags,
    pub pm_time: u16, // milliseconds, meaning depends on the PMF_TIME_* flag
    pub gravity: f32,
    pub delta_angles: [i16; 3], // added to command angles
    pub mins: Vec3,
    pub maxs: Vec3,
    pub viewheight: f32,
    pub waterlevel: WaterLevel,
    pub watertype: Contents,
    /// Set by the caller after placing the player directly (spawn,
    /// teleport) so the first move searches for a valid nearby position.
    pub snapinitial: bool,
}

impl Default for PmoveState {
    fn default() -> Self {
        Self {
            pm_type: PmType::Normal,
            origin: [0.0; 3],
            velocity: [0.0; 3],
            pm_flags: PmFlags::empty(),
            pm_time: 0,
            gravity: 800.0,
            delta_angles: [0; 3],
            mins: [-16.0, -16.0, -24.0],
            maxs: [16.0, 16.0, 32.0],
            viewheight: 22.0,
            waterlevel: WaterLevel::None,
            watertype: Contents::empty(),
            snapinitial: false,
        }
    }
}

/// One tick of player input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserCmd {
    pub msec: u8,
    pub buttons: Buttons,
    pub angles: [i16; 3],
    pub forwardmove: i16,
    pub sidemove: i16,
    pub upmove: i16,
}

impl UserCmd {
    pub fn frametime(&self) -> f32 {
        self.msec as f32 * 0.001
    }
}

// ============================================================
// Angle/short conversion
// ============================================================

#[inline]
pub fn angle2short(x: f32) -> i16 {
    (((x * 65536.0 / 360.0) as i32) & 65535) as u16 as i16
}

/// Short angle to degrees in [0, 360).
#[inline]
pub fn short2angle(x: i16) -> f32 {
    (x as u16 as f32) * (360.0 / 65536.0)
}

// ============================================================
// Vector math
// ============================================================

#[inline]
pub fn dot_product(a: &Vec3, b: &Vec3) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[inline]
pub fn vector_subtract(a: &Vec3, b: &Vec3) -> Vec3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

#[inline]
pub fn vector_add(a: &Vec3, b: &Vec3) -> Vec3 {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

/// veca + scale * vecb
#[inline]
pub fn vector_ma(veca: &Vec3, scale: f32, vecb: &Vec3) -> Vec3 {
    [
        veca[0] + scale * vecb[0],
        veca[1] + scale * vecb[1],
        veca[2] + scale * vecb[2],
    ]
}

#[inline]
pub fn vector_scale(v: &Vec3, scale: f32) -> Vec3 {
    [v[0] * scale, v[1] * scale, v[2] * scale]
}

#[inline]
pub fn vector_length(v: &Vec3) -> f32 {
    dot_product(v, v).sqrt()
}

#[inline]
pub fn vector_compare(v1: &Vec3, v2: &Vec3) -> bool {
    v1[0] == v2[0] && v1[1] == v2[1] && v1[2] == v2[2]
}

/// Normalize in place and return the original length.
pub fn vector_normalize(v: &mut Vec3) -> f32 {
    let length = vector_length(v);
    if length != 0.0 {
        let ilength = 1.0 / length;
        v[0] *= ilength;
        v[1] *= ilength;
        v[2] *= ilength;
    }
    length
}

pub fn cross_product(v1: &Vec3, v2: &Vec3) -> Vec3 {
    [
        v1[1] * v2[2] - v1[2] * v2[1],
        v1[2] * v2[0] - v1[0] * v2[2],
        v1[0] * v2[1] - v1[1] * v2[0],
    ]
}

/// Forward, right and up vectors for a set of euler angles in degrees.
pub fn angle_vectors(angles: &Vec3) -> (Vec3, Vec3, Vec3) {
    let (sy, cy) = angles[YAW].to_radians().sin_cos();
    let (sp, cp) = angles[PITCH].to_radians().sin_cos();
    let (sr, cr) = angles[ROLL].to_radians().sin_cos();

    let forward = [cp * cy, cp * sy, -sp];
    let right = [
        -sr * sp * cy + -cr * -sy,
        -sr * sp * sy + -cr * cy,
        -sr * cp,
    ];
    let up = [cr * sp * cy + -sr * -sy, cr * sp * sy + -sr * cy, cr * cp];
    (forward, right, up)
}

/// True when two boxes overlap (touching counts).
#[inline]
pub fn boxes_overlap(mins1: &Vec3, maxs1: &Vec3, mins2: &Vec3, maxs2: &Vec3) -> bool {
    !(mins1[0] > maxs2[0]
        || mins1[1] > maxs2[1]
        || mins1[2] > maxs2[2]
        || maxs1[0] < mins2[0]
        || maxs1[1] < mins2[1]
        || maxs1[2] < mins2[2])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plane_new_derives_type_and_signbits() {
        let p = CPlane::new([0.0, -1.0, 0.0], 8.0);
        assert_eq!(p.plane_type, PLANE_Y);
        assert_eq!(p.signbits, 0b010);

        let s = std::f32::consts::FRAC_1_SQRT_2;
        let p = CPlane::new([-s, 0.0, -s], 0.0);
        assert_eq!(p.plane_type, PLANE_NON_AXIAL);
        assert_eq!(p.signbits, 0b101);
    }

    #[test]
    fn test_box_on_plane_side_axial() {
        let p = CPlane::new([1.0, 0.0, 0.0], 10.0);
        assert_eq!(box_on_plane_side(&[20.0, 0.0, 0.0], &[30.0, 1.0, 1.0], &p), 1);
        assert_eq!(box_on_plane_side(&[-5.0, 0.0, 0.0], &[5.0, 1.0, 1.0], &p), 2);
        assert_eq!(box_on_plane_side(&[5.0, 0.0, 0.0], &[15.0, 1.0, 1.0], &p), 3);
    }

    #[test]
    fn test_box_on_plane_side_non_axial() {
        let s = std::f32::consts::FRAC_1_SQRT_2;
        let p = CPlane::new([s, s, 0.0], 0.0);
        assert_eq!(box_on_plane_side(&[1.0, 1.0, 0.0], &[2.0, 2.0, 1.0], &p), 1);
        assert_eq!(box_on_plane_side(&[-2.0, -2.0, 0.0], &[-1.0, -1.0, 1.0], &p), 2);
        assert_eq!(box_on_plane_side(&[-1.0, -1.0, 0.0], &[1.0, 1.0, 1.0], &p), 3);
    }

    #[test]
    fn test_short_angle_round_trip() {
        assert!((short2angle(angle2short(90.0)) - 90.0).abs() < 0.01);
        // negative angles come back in [0, 360)
        let a = short2angle(angle2short(-30.0));
        assert!((a - 330.0).abs() < 0.01, "got {}", a);
    }

    #[test]
    fn test_angle_vectors_yaw_90() {
        let (forward, right, up) = angle_vectors(&[0.0, 90.0, 0.0]);
        assert!(forward[0].abs() < 1e-6 && (forward[1] - 1.0).abs() < 1e-6);
        assert!((right[0] - 1.0).abs() < 1e-6, "right = {:?}", right);
        assert!((up[2] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_current_direction_cancels_opposites() {
        let v = current_direction(Contents::CURRENT_0 | Contents::CURRENT_180 | Contents::CURRENT_UP);
        assert_eq!(v, [0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_masks_match_expected_bits() {
        assert_eq!(MASK_SOLID.bits(), 0b11);
        assert!(MASK_PLAYERSOLID.contains(Contents::PLAYERCLIP | Contents::MONSTER));
        assert!(!MASK_DEADSOLID.contains(Contents::MONSTER));
        assert_eq!(MASK_CURRENT.bits(), 0x00fc_0000);
    }
}
