// cmodel.rs -- Collision model construction, point queries and box tracing

use crate::q_shared::{
    box_on_plane_side, dot_product, vector_compare, vector_subtract, CPlane, Contents,
    SurfaceFlags, Trace, Vec3, DIST_EPSILON,
};
use rayon::prelude::*;

// ============================================================
// Runtime structures
// ============================================================

#[derive(Debug, Clone, Default)]
pub struct CNode {
    pub plane_idx: usize,
    pub children: [i32; 2], // negative numbers are leafs
    pub mins: Vec3,
    pub maxs: Vec3,
}

#[derive(Debug, Clone, Default)]
pub struct CBrushSide {
    pub plane_idx: usize,
    pub surface_flags: SurfaceFlags,
    pub bevel: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CLeaf {
    pub contents: Contents,
    pub cluster: i32,
    pub area: i32,
    pub firstleafbrush: usize,
    pub numleafbrushes: usize,
}

#[derive(Debug, Clone, Default)]
pub struct CBrush {
    pub contents: Contents,
    pub firstbrushside: usize,
    pub numsides: usize,
}

/// How an inline model is clipped against.
#[derive(Debug, Clone, PartialEq)]
pub enum SubModelHull {
    /// A BSP subtree, used by the world and by large movers.
    Tree { headnode: i32 },
    /// A flat list of brush indices, for small inline solids.
    Brushes(Vec<usize>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CModel {
    pub mins: Vec3,
    pub maxs: Vec3,
    pub origin: Vec3, // for sounds or lights
    pub hull: SubModelHull,
}

/// Raw plane as produced by a map compiler. Type and sign bits are derived
/// on load.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaneLump {
    pub normal: Vec3,
    pub dist: f32,
}

/// Everything needed to build a [`CollisionModel`].
#[derive(Debug, Clone, Default)]
pub struct CollisionLumps {
    pub planes: Vec<PlaneLump>,
    pub nodes: Vec<CNode>,
    pub leafs: Vec<CLeaf>,
    pub leafbrushes: Vec<usize>,
    pub brushes: Vec<CBrush>,
    pub brushsides: Vec<CBrushSide>,
    /// Model 0 is the world. When empty, a world model rooted at node 0
    /// (or leaf 0 for a tree with no nodes) is created.
    pub submodels: Vec<CModel>,
}

// ============================================================
// Errors
// ============================================================

/// Contract violations found while building a collision model.
#[derive(Debug, Clone, PartialEq)]
pub enum CModelError {
    /// The model has no leafs at all.
    NoLeafs,
    /// A plane normal is zero length or not finite.
    BadPlane { plane: usize },
    /// A node or brush side references a plane that does not exist.
    PlaneIndex { what: &'static str, index: usize, plane: usize },
    /// A node child is out of range or does not point further down the tree.
    NodeChild { node: usize, child: i32 },
    /// A leaf's brush range runs past the leaf brush list.
    LeafBrushRange { leaf: usize },
    /// A leaf brush entry names a brush that does not exist.
    LeafBrushIndex { index: usize, brush: usize },
    /// A brush's side range runs past the brush side list.
    BrushSideRange { brush: usize },
    /// An inline model is malformed.
    SubModel { model: usize, reason: &'static str },
}

impl std::fmt::Display for CModelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CModelError::NoLeafs => write!(f, "Map with no leafs"),
            CModelError::BadPlane { plane } => write!(f, "Plane {} has a degenerate normal", plane),
            CModelError::PlaneIndex { what, index, plane } => {
                write!(f, "{} {} references missing plane {}", what, index, plane)
            }
            CModelError::NodeChild { node, child } => {
                write!(f, "Node {} has a bad child reference {}", node, child)
            }
            CModelError::LeafBrushRange { leaf } => {
                write!(f, "Leaf {} brush range is out of bounds", leaf)
            }
            CModelError::LeafBrushIndex { index, brush } => {
                write!(f, "Leaf brush {} references missing brush {}", index, brush)
            }
            CModelError::BrushSideRange { brush } => {
                write!(f, "Brush {} side range is out of bounds", brush)
            }
            CModelError::SubModel { model, reason } => write!(f, "Inline model {}: {}", model, reason),
        }
    }
}

impl std::error::Error for CModelError {}

// ============================================================
// Constants
// ============================================================

/// Brushes with fewer sides than this cannot enclose a volume.
const MIN_BRUSH_SIDES: usize = 4;

const MAX_POSITION_LEAFS: usize = 1024;

// ============================================================
// Per-trace parameters
// ============================================================

/// Fixed inputs of one trace. Nothing here changes during traversal.
struct TraceWork {
    start: Vec3,
    end: Vec3,
    mins: Vec3,
    maxs: Vec3,
    extents: Vec3,
    ispoint: bool,
    contents: Contents,
    epsilon: f32,
}

impl TraceWork {
    fn new(start: &Vec3, end: &Vec3, mins: &Vec3, maxs: &Vec3, contents: Contents, epsilon: f32) -> Self {
        let ispoint = mins.iter().chain(maxs.iter()).all(|&v| v == 0.0);
        let extents = if ispoint {
            [0.0; 3]
        } else {
            [
                (-mins[0]).max(maxs[0]),
                (-mins[1]).max(maxs[1]),
                (-mins[2]).max(maxs[2]),
            ]
        };
        Self {
            start: *start,
            end: *end,
            mins: *mins,
            maxs: *maxs,
            extents,
            ispoint,
            contents,
            epsilon,
        }
    }

    /// Plane distance pushed out by the box corner nearest the plane.
    fn expanded_dist(&self, plane: &CPlane) -> f32 {
        if self.ispoint {
            return plane.dist;
        }
        let mut ofs = [0.0f32; 3];
        for j in 0..3 {
            ofs[j] = if plane.normal[j] < 0.0 { self.maxs[j] } else { self.mins[j] };
        }
        plane.dist - dot_product(&ofs, &plane.normal)
    }
}

// ============================================================
// Brush clipping
// ============================================================

/// Clip the swept box against one convex brush given by its sides and
/// return the better of `trace` and the brush hit.
fn clip_box_to_sides<'a, I>(tw: &TraceWork, sides: I, contents: Contents, mut trace: Trace) -> Trace
where
    I: Iterator<Item = (&'a CPlane, SurfaceFlags)>,
{
    let mut enterfrac: f32 = -1.0;
    let mut leavefrac: f32 = 1.0;
    let mut clipplane: Option<(&CPlane, SurfaceFlags)> = None;

    let mut getout = false;
    let mut startout = false;
    let mut numsides = 0;

    for (plane, surface_flags) in sides {
        numsides += 1;
        let dist = tw.expanded_dist(plane);

        let d1 = dot_product(&tw.start, &plane.normal) - dist;
        let d2 = dot_product(&tw.end, &plane.normal) - dist;

        if d2 > 0.0 {
            getout = true; // endpoint is not in solid
        }
        if d1 > 0.0 {
            startout = true;
        }

        // if completely in front of face, no intersection
        if d1 > 0.0 && d2 >= d1 {
            return trace;
        }
        if d1 <= 0.0 && d2 <= 0.0 {
            continue;
        }

        // crosses face
        if d1 > d2 {
            // enter
            let f = (d1 - tw.epsilon) / (d1 - d2);
            if f > enterfrac {
                enterfrac = f;
                clipplane = Some((plane, surface_flags));
            }
        } else {
            // leave
            let f = (d1 + tw.epsilon) / (d1 - d2);
            if f < leavefrac {
                leavefrac = f;
            }
        }
    }

    if numsides == 0 {
        return trace;
    }

    if !startout {
        // original point was inside brush
        trace.startsolid = true;
        if !getout {
            trace.allsolid = true;
        }
        return trace;
    }

    if enterfrac < leavefrac && enterfrac > -1.0 && enterfrac < trace.fraction {
        trace.fraction = enterfrac.max(0.0);
        if let Some((plane, surface_flags)) = clipplane {
            trace.plane = *plane;
            trace.surface_flags = surface_flags;
        }
        trace.contents = contents;
    }
    trace
}

/// Position test of the box at `tw.start` against one brush.
fn test_box_in_sides<'a, I>(tw: &TraceWork, sides: I, contents: Contents, mut trace: Trace) -> Trace
where
    I: Iterator<Item = (&'a CPlane, SurfaceFlags)>,
{
    let mut numsides = 0;
    for (plane, _) in sides {
        numsides += 1;
        let dist = tw.expanded_dist(plane);
        let d1 = dot_product(&tw.start, &plane.normal) - dist;

        // if completely in front of face, no intersection
        if d1 > 0.0 {
            return trace;
        }
    }
    if numsides == 0 {
        return trace;
    }

    // inside this brush
    trace.startsolid = true;
    trace.allsolid = true;
    trace.fraction = 0.0;
    trace.contents = contents;
    trace
}

/// Map a trace made in model-local space back to world space.
fn translate_back(mut trace: Trace, start: &Vec3, end: &Vec3, origin: &Vec3) -> Trace {
    if trace.fraction != 1.0 {
        trace.plane.dist += dot_product(&trace.plane.normal, origin);
    }
    finish_endpos(trace, start, end)
}

fn finish_endpos(mut trace: Trace, start: &Vec3, end: &Vec3) -> Trace {
    if trace.fraction == 1.0 {
        trace.endpos = *end;
    } else {
        for i in 0..3 {
            trace.endpos[i] = start[i] + trace.fraction * (end[i] - start[i]);
        }
    }
    trace
}

// ============================================================
// Implicit box brush
// ============================================================

/// Six axial planes enclosing an absolute box. Used to clip against
/// bounding-box entities without touching the shared model.
#[derive(Debug, Clone, Copy)]
pub struct BoxBrush {
    planes: [CPlane; 6],
    pub contents: Contents,
}

impl BoxBrush {
    pub fn new(mins: &Vec3, maxs: &Vec3, contents: Contents) -> Self {
        let mut planes = [CPlane::default(); 6];
        for axis in 0..3 {
            let mut normal = [0.0f32; 3];
            normal[axis] = 1.0;
            planes[axis * 2] = CPlane::new(normal, maxs[axis]);
            normal[axis] = -1.0;
            planes[axis * 2 + 1] = CPlane::new(normal, -mins[axis]);
        }
        Self { planes, contents }
    }

    fn sides(&self) -> impl Iterator<Item = (&CPlane, SurfaceFlags)> {
        self.planes.iter().map(|p| (p, SurfaceFlags::empty()))
    }

    pub fn contains_point(&self, p: &Vec3) -> bool {
        self.planes
            .iter()
            .all(|plane| dot_product(p, &plane.normal) - plane.dist <= 0.0)
    }
}

// ============================================================
// Collision model
// ============================================================

/// Immutable brush/BSP collision geometry. Safe to share between threads;
/// tracing never writes to it.
#[derive(Debug, Clone)]
pub struct CollisionModel {
    planes: Vec<CPlane>,
    nodes: Vec<CNode>,
    leafs: Vec<CLeaf>,
    /// Union of the contents of every brush listed in each leaf.
    leaf_brush_contents: Vec<Contents>,
    leafbrushes: Vec<usize>,
    brushes: Vec<CBrush>,
    brushsides: Vec<CBrushSide>,
    cmodels: Vec<CModel>,
    dist_epsilon: f32,
}

impl CollisionModel {
    /// Plane lumps at least this large are prepared in parallel.
    pub const PARALLEL_LUMP_THRESHOLD: usize = 1024;

    /// A model with a single empty leaf. Every trace is clear.
    pub fn empty() -> Self {
        Self {
            planes: Vec::new(),
            nodes: Vec::new(),
            leafs: vec![CLeaf::default()],
            leaf_brush_contents: vec![Contents::empty()],
            leafbrushes: Vec::new(),
            brushes: Vec::new(),
            brushsides: Vec::new(),
            cmodels: vec![CModel {
                mins: [0.0; 3],
                maxs: [0.0; 3],
                origin: [0.0; 3],
                hull: SubModelHull::Tree { headnode: -1 },
            }],
            dist_epsilon: DIST_EPSILON,
        }
    }

    /// Validate the lumps and build the runtime model.
    pub fn from_lumps(lumps: CollisionLumps) -> Result<Self, CModelError> {
        let CollisionLumps {
            planes,
            nodes,
            leafs,
            leafbrushes,
            mut brushes,
            brushsides,
            mut submodels,
        } = lumps;

        if leafs.is_empty() {
            return Err(CModelError::NoLeafs);
        }

        let planes = Self::load_planes(&planes)?;

        for (i, node) in nodes.iter().enumerate() {
            if node.plane_idx >= planes.len() {
                return Err(CModelError::PlaneIndex { what: "Node", index: i, plane: node.plane_idx });
            }
            for &child in &node.children {
                let ok = if child >= 0 {
                    // children must lie further down the list, which also rules out cycles
                    (child as usize) > i && (child as usize) < nodes.len()
                } else {
                    ((-1 - child) as usize) < leafs.len()
                };
                if !ok {
                    return Err(CModelError::NodeChild { node: i, child });
                }
            }
        }

        for (i, side) in brushsides.iter().enumerate() {
            if side.plane_idx >= planes.len() {
                return Err(CModelError::PlaneIndex { what: "Brush side", index: i, plane: side.plane_idx });
            }
        }

        let mut degenerate = 0;
        for (i, brush) in brushes.iter_mut().enumerate() {
            if brush.firstbrushside + brush.numsides > brushsides.len() {
                return Err(CModelError::BrushSideRange { brush: i });
            }
            if brush.numsides > 0 && brush.numsides < MIN_BRUSH_SIDES {
                brush.numsides = 0;
                degenerate += 1;
            }
        }
        if degenerate > 0 {
            log::debug!("cmodel: ignoring {} degenerate brushes", degenerate);
        }

        for (i, &b) in leafbrushes.iter().enumerate() {
            if b >= brushes.len() {
                return Err(CModelError::LeafBrushIndex { index: i, brush: b });
            }
        }

        let mut leaf_brush_contents = Vec::with_capacity(leafs.len());
        for (i, leaf) in leafs.iter().enumerate() {
            if leaf.firstleafbrush + leaf.numleafbrushes > leafbrushes.len() {
                return Err(CModelError::LeafBrushRange { leaf: i });
            }
            let union = leafbrushes[leaf.firstleafbrush..leaf.firstleafbrush + leaf.numleafbrushes]
                .iter()
                .fold(Contents::empty(), |acc, &b| acc | brushes[b].contents);
            leaf_brush_contents.push(union);
        }

        if submodels.is_empty() {
            submodels.push(CModel {
                mins: [0.0; 3],
                maxs: [0.0; 3],
                origin: [0.0; 3],
                hull: SubModelHull::Tree { headnode: if nodes.is_empty() { -1 } else { 0 } },
            });
        }
        for (i, model) in submodels.iter().enumerate() {
            if (0..3).any(|j| model.mins[j] > model.maxs[j]) {
                return Err(CModelError::SubModel { model: i, reason: "inverted bounds" });
            }
            match &model.hull {
                SubModelHull::Tree { headnode } => {
                    let ok = if *headnode >= 0 {
                        (*headnode as usize) < nodes.len()
                    } else {
                        ((-1 - *headnode) as usize) < leafs.len()
                    };
                    if !ok {
                        return Err(CModelError::SubModel { model: i, reason: "headnode out of range" });
                    }
                }
                SubModelHull::Brushes(list) => {
                    if list.iter().any(|&b| b >= brushes.len()) {
                        return Err(CModelError::SubModel { model: i, reason: "brush index out of range" });
                    }
                }
            }
        }

        Ok(Self {
            planes,
            nodes,
            leafs,
            leaf_brush_contents,
            leafbrushes,
            brushes,
            brushsides,
            cmodels: submodels,
            dist_epsilon: DIST_EPSILON,
        })
    }

    fn load_plane(index: usize, lump: &PlaneLump) -> Result<CPlane, CModelError> {
        let mut normal = lump.normal;
        let length = dot_product(&normal, &normal).sqrt();
        if !length.is_finite() || length == 0.0 || !lump.dist.is_finite() {
            return Err(CModelError::BadPlane { plane: index });
        }
        let mut dist = lump.dist;
        if length != 1.0 {
            for n in normal.iter_mut() {
                *n /= length;
            }
            dist /= length;
        }
        Ok(CPlane::new(normal, dist))
    }

    fn load_planes(lumps: &[PlaneLump]) -> Result<Vec<CPlane>, CModelError> {
        // Use parallel preparation for large plane counts
        if lumps.len() >= Self::PARALLEL_LUMP_THRESHOLD {
            lumps
                .par_iter()
                .enumerate()
                .map(|(i, p)| Self::load_plane(i, p))
                .collect()
        } else {
            lumps
                .iter()
                .enumerate()
                .map(|(i, p)| Self::load_plane(i, p))
                .collect()
        }
    }

    /// Build a single-leaf model from axis-aligned solid boxes. Every box
    /// becomes one six-sided brush; model 0 is the leaf.
    pub fn from_boxes(boxes: &[(Vec3, Vec3, Contents)]) -> Result<Self, CModelError> {
        let mut lumps = CollisionLumps::default();
        for (mins, maxs, contents) in boxes {
            let firstbrushside = lumps.brushsides.len();
            let brush = BoxBrush::new(mins, maxs, *contents);
            for plane in brush.planes.iter() {
                lumps.brushsides.push(CBrushSide {
                    plane_idx: lumps.planes.len(),
                    surface_flags: SurfaceFlags::empty(),
                    bevel: false,
                });
                lumps.planes.push(PlaneLump { normal: plane.normal, dist: plane.dist });
            }
            lumps.leafbrushes.push(lumps.brushes.len());
            lumps.brushes.push(CBrush { contents: *contents, firstbrushside, numsides: 6 });
        }
        lumps.leafs.push(CLeaf {
            contents: Contents::empty(),
            cluster: 0,
            area: 0,
            firstleafbrush: 0,
            numleafbrushes: lumps.leafbrushes.len(),
        });
        Self::from_lumps(lumps)
    }

    /// Override the distance traces stop short of surfaces.
    pub fn with_dist_epsilon(mut self, epsilon: f32) -> Self {
        self.dist_epsilon = epsilon;
        self
    }

    pub fn dist_epsilon(&self) -> f32 {
        self.dist_epsilon
    }

    // ============================================================
    // Accessors
    // ============================================================

    pub fn num_inline_models(&self) -> usize {
        self.cmodels.len()
    }

    pub fn inline_model(&self, index: usize) -> Option<&CModel> {
        self.cmodels.get(index)
    }

    pub fn world_headnode(&self) -> i32 {
        match self.cmodels[0].hull {
            SubModelHull::Tree { headnode } => headnode,
            SubModelHull::Brushes(_) => -1,
        }
    }

    pub fn num_leafs(&self) -> usize {
        self.leafs.len()
    }

    pub fn num_brushes(&self) -> usize {
        self.brushes.len()
    }

    pub fn plane(&self, index: usize) -> Option<&CPlane> {
        self.planes.get(index)
    }

    pub fn leaf_contents(&self, leafnum: usize) -> Contents {
        self.leafs[leafnum].contents
    }

    pub fn leaf_cluster(&self, leafnum: usize) -> i32 {
        self.leafs[leafnum].cluster
    }

    pub fn leaf_area(&self, leafnum: usize) -> i32 {
        self.leafs[leafnum].area
    }

    fn brush_sides(&self, brush: &CBrush) -> impl Iterator<Item = (&CPlane, SurfaceFlags)> {
        self.brushsides[brush.firstbrushside..brush.firstbrushside + brush.numsides]
            .iter()
            .map(move |side| (&self.planes[side.plane_idx], side.surface_flags))
    }

    fn leaf_brushes(&self, leafnum: usize) -> &[usize] {
        let leaf = &self.leafs[leafnum];
        &self.leafbrushes[leaf.firstleafbrush..leaf.firstleafbrush + leaf.numleafbrushes]
    }

    // ============================================================
    // Point / leaf queries
    // ============================================================

    pub fn point_leafnum(&self, p: &Vec3, headnode: i32) -> usize {
        let mut num = headnode;
        while num >= 0 {
            let node = &self.nodes[num as usize];
            let plane = &self.planes[node.plane_idx];

            let d = if plane.plane_type < 3 {
                p[plane.plane_type as usize] - plane.dist
            } else {
                dot_product(&plane.normal, p) - plane.dist
            };

            num = if d < 0.0 { node.children[1] } else { node.children[0] };
        }
        (-1 - num) as usize
    }

    fn brush_contains_point(&self, brush: &CBrush, p: &Vec3) -> bool {
        brush.numsides > 0
            && self
                .brush_sides(brush)
                .all(|(plane, _)| dot_product(p, &plane.normal) - plane.dist <= 0.0)
    }

    /// Contents of the leaf holding `p`, plus any of its brushes that
    /// contain the point.
    pub fn point_contents(&self, p: &Vec3, headnode: i32) -> Contents {
        let l = self.point_leafnum(p, headnode);
        let mut contents = self.leafs[l].contents;
        for &b in self.leaf_brushes(l) {
            let brush = &self.brushes[b];
            if !contents.contains(brush.contents) && self.brush_contains_point(brush, p) {
                contents |= brush.contents;
            }
        }
        contents
    }

    /// Contents of an inline model at `p`.
    pub fn model_point_contents(&self, p: &Vec3, model: usize) -> Contents {
        match self.cmodels.get(model).map(|m| &m.hull) {
            Some(SubModelHull::Tree { headnode }) => self.point_contents(p, *headnode),
            Some(SubModelHull::Brushes(list)) => list
                .iter()
                .map(|&b| &self.brushes[b])
                .filter(|brush| self.brush_contains_point(brush, p))
                .fold(Contents::empty(), |acc, brush| acc | brush.contents),
            None => Contents::empty(),
        }
    }

    /// Point contents of a model placed at `origin`. Models only translate.
    pub fn transformed_point_contents(&self, p: &Vec3, model: usize, origin: &Vec3) -> Contents {
        let p_l = vector_subtract(p, origin);
        self.model_point_contents(&p_l, model)
    }

    /// Leafs touched by a box, and the first node that splits it (if any).
    pub fn box_leafnums(
        &self,
        mins: &Vec3,
        maxs: &Vec3,
        headnode: i32,
        maxcount: usize,
    ) -> (Vec<usize>, Option<i32>) {
        let mut list = Vec::new();
        let mut topnode = None;
        self.box_leafnums_r(headnode, mins, maxs, maxcount, &mut list, &mut topnode);
        (list, topnode)
    }

    fn box_leafnums_r(
        &self,
        mut nodenum: i32,
        mins: &Vec3,
        maxs: &Vec3,
        maxcount: usize,
        list: &mut Vec<usize>,
        topnode: &mut Option<i32>,
    ) {
        loop {
            if nodenum < 0 {
                if list.len() < maxcount {
                    list.push((-1 - nodenum) as usize);
                }
                return;
            }

            let node = &self.nodes[nodenum as usize];
            let plane = &self.planes[node.plane_idx];
            match box_on_plane_side(mins, maxs, plane) {
                1 => nodenum = node.children[0],
                2 => nodenum = node.children[1],
                _ => {
                    // go down both
                    if topnode.is_none() {
                        *topnode = Some(nodenum);
                    }
                    self.box_leafnums_r(node.children[0], mins, maxs, maxcount, list, topnode);
                    nodenum = node.children[1];
                }
            }
        }
    }

    // ============================================================
    // Box tracing
    // ============================================================

    fn clip_box_to_brush(&self, tw: &TraceWork, brush_idx: usize, trace: Trace) -> Trace {
        let brush = &self.brushes[brush_idx];
        if brush.numsides == 0 || !brush.contents.intersects(tw.contents) {
            return trace;
        }
        clip_box_to_sides(tw, self.brush_sides(brush), brush.contents, trace)
    }

    fn test_box_in_brush(&self, tw: &TraceWork, brush_idx: usize, trace: Trace) -> Trace {
        let brush = &self.brushes[brush_idx];
        if brush.numsides == 0 || !brush.contents.intersects(tw.contents) {
            return trace;
        }
        test_box_in_sides(tw, self.brush_sides(brush), brush.contents, trace)
    }

    fn trace_to_leaf(&self, tw: &TraceWork, leafnum: usize, mut trace: Trace) -> Trace {
        if !self.leaf_brush_contents[leafnum].intersects(tw.contents) {
            return trace;
        }
        for &brushnum in self.leaf_brushes(leafnum) {
            trace = self.clip_box_to_brush(tw, brushnum, trace);
            if trace.fraction == 0.0 {
                break;
            }
        }
        trace
    }

    fn test_in_leaf(&self, tw: &TraceWork, leafnum: usize, mut trace: Trace) -> Trace {
        if !self.leaf_brush_contents[leafnum].intersects(tw.contents) {
            return trace;
        }
        for &brushnum in self.leaf_brushes(leafnum) {
            trace = self.test_box_in_brush(tw, brushnum, trace);
            if trace.fraction == 0.0 {
                break;
            }
        }
        trace
    }

    /// Best hit within `[p1f, p2f]` of the subtree at `num`, given the best
    /// hit found so far.
    #[allow(clippy::too_many_arguments)]
    fn recursive_hull_check(
        &self,
        tw: &TraceWork,
        num: i32,
        p1f: f32,
        p2f: f32,
        p1: &Vec3,
        p2: &Vec3,
        trace: Trace,
    ) -> Trace {
        if trace.fraction <= p1f {
            return trace; // already hit something nearer
        }

        // if < 0, we are in a leaf node
        if num < 0 {
            return self.trace_to_leaf(tw, (-1 - num) as usize, trace);
        }

        // find the point distances to the separating plane
        // and the offset for the size of the box
        let node = &self.nodes[num as usize];
        let plane = &self.planes[node.plane_idx];

        let (t1, t2, offset) = if plane.plane_type < 3 {
            let pt = plane.plane_type as usize;
            (p1[pt] - plane.dist, p2[pt] - plane.dist, tw.extents[pt])
        } else {
            let offset = if tw.ispoint {
                0.0
            } else {
                (tw.extents[0] * plane.normal[0]).abs()
                    + (tw.extents[1] * plane.normal[1]).abs()
                    + (tw.extents[2] * plane.normal[2]).abs()
            };
            (
                dot_product(&plane.normal, p1) - plane.dist,
                dot_product(&plane.normal, p2) - plane.dist,
                offset,
            )
        };

        // see which sides we need to consider
        if t1 >= offset && t2 >= offset {
            return self.recursive_hull_check(tw, node.children[0], p1f, p2f, p1, p2, trace);
        }
        if t1 < -offset && t2 < -offset {
            return self.recursive_hull_check(tw, node.children[1], p1f, p2f, p1, p2, trace);
        }

        // put the crosspoint DIST_EPSILON pixels on the near side
        let (side, frac, frac2) = if t1 < t2 {
            let idist = 1.0 / (t1 - t2);
            (
                1usize,
                ((t1 - offset + tw.epsilon) * idist).clamp(0.0, 1.0),
                ((t1 + offset + tw.epsilon) * idist).clamp(0.0, 1.0),
            )
        } else if t1 > t2 {
            let idist = 1.0 / (t1 - t2);
            (
                0usize,
                ((t1 + offset + tw.epsilon) * idist).clamp(0.0, 1.0),
                ((t1 - offset - tw.epsilon) * idist).clamp(0.0, 1.0),
            )
        } else {
            (0usize, 1.0, 0.0)
        };

        // move up to the node
        let midf = p1f + (p2f - p1f) * frac;
        let mid: Vec3 = [
            p1[0] + frac * (p2[0] - p1[0]),
            p1[1] + frac * (p2[1] - p1[1]),
            p1[2] + frac * (p2[2] - p1[2]),
        ];
        let trace = self.recursive_hull_check(tw, node.children[side], p1f, midf, p1, &mid, trace);

        // go past the node
        let midf2 = p1f + (p2f - p1f) * frac2;
        let mid2: Vec3 = [
            p1[0] + frac2 * (p2[0] - p1[0]),
            p1[1] + frac2 * (p2[1] - p1[1]),
            p1[2] + frac2 * (p2[2] - p1[2]),
        ];
        self.recursive_hull_check(tw, node.children[side ^ 1], midf2, p2f, &mid2, p2, trace)
    }

    /// Sweep a box from `start` to `end` through the tree at `headnode`.
    pub fn box_trace(
        &self,
        start: &Vec3,
        end: &Vec3,
        mins: &Vec3,
        maxs: &Vec3,
        headnode: i32,
        brushmask: Contents,
    ) -> Trace {
        let tw = TraceWork::new(start, end, mins, maxs, brushmask, self.dist_epsilon);
        let mut trace = Trace::default();

        // check for position test special case
        if vector_compare(start, end) {
            let c1 = [
                start[0] + mins[0] - 1.0,
                start[1] + mins[1] - 1.0,
                start[2] + mins[2] - 1.0,
            ];
            let c2 = [
                start[0] + maxs[0] + 1.0,
                start[1] + maxs[1] + 1.0,
                start[2] + maxs[2] + 1.0,
            ];
            let (leafs, _) = self.box_leafnums(&c1, &c2, headnode, MAX_POSITION_LEAFS);
            for leafnum in leafs {
                trace = self.test_in_leaf(&tw, leafnum, trace);
                if trace.allsolid {
                    break;
                }
            }
            trace.endpos = *start;
            return trace;
        }

        trace = self.recursive_hull_check(&tw, headnode, 0.0, 1.0, start, end, trace);
        finish_endpos(trace, start, end)
    }

    /// Sweep against a flat brush list.
    pub fn brush_list_trace(
        &self,
        brushes: &[usize],
        start: &Vec3,
        end: &Vec3,
        mins: &Vec3,
        maxs: &Vec3,
        brushmask: Contents,
    ) -> Trace {
        let tw = TraceWork::new(start, end, mins, maxs, brushmask, self.dist_epsilon);
        let mut trace = Trace::default();

        if vector_compare(start, end) {
            for &b in brushes {
                trace = self.test_box_in_brush(&tw, b, trace);
                if trace.allsolid {
                    break;
                }
            }
            trace.endpos = *start;
            return trace;
        }

        for &b in brushes {
            trace = self.clip_box_to_brush(&tw, b, trace);
            if trace.fraction == 0.0 {
                break;
            }
        }
        finish_endpos(trace, start, end)
    }

    /// Trace against inline model `model`. Unknown models never block.
    pub fn trace_model(
        &self,
        model: usize,
        start: &Vec3,
        end: &Vec3,
        mins: &Vec3,
        maxs: &Vec3,
        brushmask: Contents,
    ) -> Trace {
        match self.cmodels.get(model).map(|m| &m.hull) {
            Some(SubModelHull::Tree { headnode }) => {
                self.box_trace(start, end, mins, maxs, *headnode, brushmask)
            }
            Some(SubModelHull::Brushes(list)) => {
                self.brush_list_trace(list, start, end, mins, maxs, brushmask)
            }
            None => Trace::clear(end),
        }
    }

    /// Trace against a model placed at `origin`. Models only translate, so
    /// the plane normal carries over unchanged.
    #[allow(clippy::too_many_arguments)]
    pub fn transformed_trace_model(
        &self,
        model: usize,
        start: &Vec3,
        end: &Vec3,
        mins: &Vec3,
        maxs: &Vec3,
        brushmask: Contents,
        origin: &Vec3,
    ) -> Trace {
        let start_l = vector_subtract(start, origin);
        let end_l = vector_subtract(end, origin);

        let trace = self.trace_model(model, &start_l, &end_l, mins, maxs, brushmask);
        translate_back(trace, start, end, origin)
    }

    /// `box_trace` through a subtree placed at `origin`.
    #[allow(clippy::too_many_arguments)]
    pub fn transformed_box_trace(
        &self,
        start: &Vec3,
        end: &Vec3,
        mins: &Vec3,
        maxs: &Vec3,
        headnode: i32,
        brushmask: Contents,
        origin: &Vec3,
    ) -> Trace {
        let start_l = vector_subtract(start, origin);
        let end_l = vector_subtract(end, origin);

        let trace = self.box_trace(&start_l, &end_l, mins, maxs, headnode, brushmask);
        translate_back(trace, start, end, origin)
    }

    /// Sweep against an implicit box brush using this model's epsilon.
    pub fn trace_box_brush(
        &self,
        brush: &BoxBrush,
        start: &Vec3,
        end: &Vec3,
        mins: &Vec3,
        maxs: &Vec3,
    ) -> Trace {
        let tw = TraceWork::new(start, end, mins, maxs, brush.contents, self.dist_epsilon);
        if vector_compare(start, end) {
            let mut trace = test_box_in_sides(&tw, brush.sides(), brush.contents, Trace::default());
            trace.endpos = *start;
            return trace;
        }
        let trace = clip_box_to_sides(&tw, brush.sides(), brush.contents, Trace::default());
        finish_endpos(trace, start, end)
    }
}

impl Default for CollisionModel {
    fn default() -> Self {
        Self::empty()
    }
}

// ============================================================
// Unit tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::q_shared::{Contents, MASK_ALL, MASK_SOLID};
    use rand::{rngs::StdRng, Rng, SeedableRng};

    const EPS: f32 = 1e-4;

    fn cube(half: f32) -> (Vec3, Vec3, Contents) {
        ([-half; 3], [half; 3], Contents::SOLID)
    }

    /// Two solid boxes either side of the x=0 plane, split into a
    /// three-leaf tree: node 0 splits on x, leaf 1 holds the +x box,
    /// leaf 2 the -x box, leaf 0 is the empty outside leaf.
    fn make_split_model() -> CollisionModel {
        // box A: x 64..128, box B: x -128..-64, both y/z -32..32
        let a = BoxBrush::new(&[64.0, -32.0, -32.0], &[128.0, 32.0, 32.0], Contents::SOLID);
        let b = BoxBrush::new(&[-128.0, -32.0, -32.0], &[-64.0, 32.0, 32.0], Contents::WATER);

        let mut lumps = CollisionLumps::default();
        lumps.planes.push(PlaneLump { normal: [1.0, 0.0, 0.0], dist: 0.0 });
        for (brush, contents) in [(a, Contents::SOLID), (b, Contents::WATER)] {
            let first = lumps.brushsides.len();
            for plane in brush.planes.iter() {
                lumps.brushsides.push(CBrushSide {
                    plane_idx: lumps.planes.len(),
                    surface_flags: SurfaceFlags::empty(),
                    bevel: false,
                });
                lumps.planes.push(PlaneLump { normal: plane.normal, dist: plane.dist });
            }
            lumps.brushes.push(CBrush { contents, firstbrushside: first, numsides: 6 });
        }
        lumps.leafbrushes = vec![0, 1];
        lumps.leafs = vec![
            CLeaf::default(),
            CLeaf { contents: Contents::empty(), cluster: 0, area: 0, firstleafbrush: 0, numleafbrushes: 1 },
            CLeaf { contents: Contents::empty(), cluster: 0, area: 0, firstleafbrush: 1, numleafbrushes: 1 },
        ];
        lumps.nodes.push(CNode {
            plane_idx: 0,
            children: [-2, -3],
            mins: [-128.0; 3],
            maxs: [128.0; 3],
        });
        CollisionModel::from_lumps(lumps).expect("split model should build")
    }

    // =========================================================================
    // Construction
    // =========================================================================

    #[test]
    fn test_model_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CollisionModel>();
    }

    #[test]
    fn test_from_lumps_rejects_empty_leafs() {
        let err = CollisionModel::from_lumps(CollisionLumps::default()).unwrap_err();
        assert_eq!(err, CModelError::NoLeafs);
    }

    #[test]
    fn test_from_lumps_rejects_zero_normal() {
        let mut lumps = CollisionLumps::default();
        lumps.leafs.push(CLeaf::default());
        lumps.planes.push(PlaneLump { normal: [0.0; 3], dist: 4.0 });
        let err = CollisionModel::from_lumps(lumps).unwrap_err();
        assert_eq!(err, CModelError::BadPlane { plane: 0 });
        assert!(err.to_string().contains("Plane 0"));
    }

    #[test]
    fn test_from_lumps_rejects_backward_node_child() {
        let mut lumps = CollisionLumps::default();
        lumps.leafs.push(CLeaf::default());
        lumps.planes.push(PlaneLump { normal: [0.0, 0.0, 1.0], dist: 0.0 });
        lumps.nodes.push(CNode { plane_idx: 0, children: [0, -1], ..Default::default() });
        let err = CollisionModel::from_lumps(lumps).unwrap_err();
        assert_eq!(err, CModelError::NodeChild { node: 0, child: 0 });
    }

    #[test]
    fn test_from_lumps_rejects_missing_leaf_brush() {
        let mut lumps = CollisionLumps::default();
        lumps.leafbrushes.push(3);
        lumps.leafs.push(CLeaf { numleafbrushes: 1, ..Default::default() });
        let err = CollisionModel::from_lumps(lumps).unwrap_err();
        assert_eq!(err, CModelError::LeafBrushIndex { index: 0, brush: 3 });
    }

    #[test]
    fn test_from_lumps_rejects_bad_submodel_brush() {
        let mut lumps = CollisionLumps::default();
        lumps.leafs.push(CLeaf::default());
        lumps.submodels.push(CModel {
            mins: [0.0; 3],
            maxs: [0.0; 3],
            origin: [0.0; 3],
            hull: SubModelHull::Brushes(vec![0]),
        });
        let err = CollisionModel::from_lumps(lumps).unwrap_err();
        assert!(matches!(err, CModelError::SubModel { model: 0, .. }));
    }

    #[test]
    fn test_from_lumps_normalizes_planes() {
        let mut lumps = CollisionLumps::default();
        lumps.leafs.push(CLeaf::default());
        lumps.planes.push(PlaneLump { normal: [0.0, 0.0, -2.0], dist: 8.0 });
        let cm = CollisionModel::from_lumps(lumps).unwrap();
        let p = cm.plane(0).unwrap();
        assert_eq!(p.normal, [0.0, 0.0, -1.0]);
        assert!((p.dist - 4.0).abs() < EPS);
        assert_eq!(p.plane_type, 2);
        assert_eq!(p.signbits, 0b100);
    }

    #[test]
    fn test_parallel_plane_load_matches_serial() {
        let mut lumps = CollisionLumps::default();
        lumps.leafs.push(CLeaf::default());
        for i in 0..CollisionModel::PARALLEL_LUMP_THRESHOLD + 8 {
            let n = if i % 2 == 0 { [-1.0, 0.0, 0.0] } else { [0.6, 0.8, 0.0] };
            lumps.planes.push(PlaneLump { normal: n, dist: i as f32 });
        }
        let cm = CollisionModel::from_lumps(lumps).unwrap();
        assert_eq!(cm.plane(0).unwrap().signbits, 0b001);
        assert_eq!(cm.plane(0).unwrap().plane_type, 0);
        assert_eq!(cm.plane(1).unwrap().plane_type, 3);
        assert_eq!(cm.plane(1).unwrap().signbits, 0);
        assert_eq!(cm.plane(1030).unwrap().dist, 1030.0);
    }

    #[test]
    fn test_degenerate_brush_is_always_missed() {
        let mut lumps = CollisionLumps::default();
        for n in [[1.0, 0.0, 0.0], [-1.0, 0.0, 0.0], [0.0, 0.0, 1.0]] {
            lumps.brushsides.push(CBrushSide { plane_idx: lumps.planes.len(), ..Default::default() });
            lumps.planes.push(PlaneLump { normal: n, dist: 16.0 });
        }
        lumps.brushes.push(CBrush { contents: Contents::SOLID, firstbrushside: 0, numsides: 3 });
        lumps.leafbrushes.push(0);
        lumps.leafs.push(CLeaf { numleafbrushes: 1, ..Default::default() });
        let cm = CollisionModel::from_lumps(lumps).unwrap();

        let tr = cm.box_trace(&[-64.0, 0.0, 0.0], &[64.0, 0.0, 0.0], &[0.0; 3], &[0.0; 3], -1, MASK_ALL);
        assert_eq!(tr.fraction, 1.0, "degenerate brush must not block");
        let tr = cm.box_trace(&[0.0; 3], &[0.0; 3], &[0.0; 3], &[0.0; 3], -1, MASK_ALL);
        assert!(!tr.startsolid);
    }

    // =========================================================================
    // Tracing against a single leaf
    // =========================================================================

    #[test]
    fn test_point_trace_through_cube_stops_short() {
        let cm = CollisionModel::from_boxes(&[cube(32.0)]).unwrap();
        let start = [-64.0, 0.0, 0.0];
        let end = [64.0, 0.0, 0.0];
        let tr = cm.box_trace(&start, &end, &[0.0; 3], &[0.0; 3], -1, MASK_SOLID);

        let expected = (32.0 - DIST_EPSILON) / 128.0;
        assert!((tr.fraction - expected).abs() < 1e-6, "fraction = {}", tr.fraction);
        assert!((tr.endpos[0] - -32.03125).abs() < EPS, "endpos = {:?}", tr.endpos);
        assert_eq!(tr.plane.normal, [-1.0, 0.0, 0.0]);
        assert_eq!(tr.contents, Contents::SOLID);
        assert!(!tr.startsolid && !tr.allsolid);
    }

    #[test]
    fn test_trace_outside_everything_is_clear() {
        let cm = CollisionModel::from_boxes(&[cube(32.0)]).unwrap();
        let start = [-64.0, 100.0, 0.0];
        let end = [64.0, 100.0, 5.0];
        let tr = cm.box_trace(&start, &end, &[-8.0; 3], &[8.0; 3], -1, MASK_SOLID);
        assert_eq!(tr.fraction, 1.0);
        assert_eq!(tr.endpos, end);
        assert!(!tr.startsolid);
    }

    #[test]
    fn test_box_trace_expands_by_extents() {
        let cm = CollisionModel::from_boxes(&[cube(32.0)]).unwrap();
        let start = [-128.0, 0.0, 0.0];
        let end = [0.0, 0.0, 0.0];
        let tr = cm.box_trace(&start, &end, &[-16.0; 3], &[16.0; 3], -1, MASK_SOLID);
        // face at x = -32, box reaches 16 ahead of its origin
        assert!((tr.endpos[0] - (-48.0 - DIST_EPSILON)).abs() < EPS, "endpos = {:?}", tr.endpos);
    }

    #[test]
    fn test_trace_starting_inside_is_startsolid() {
        let cm = CollisionModel::from_boxes(&[cube(32.0)]).unwrap();
        let tr = cm.box_trace(&[0.0; 3], &[64.0, 0.0, 0.0], &[0.0; 3], &[0.0; 3], -1, MASK_SOLID);
        assert!(tr.startsolid);
        assert!(!tr.allsolid, "segment leaves the brush");

        let tr = cm.box_trace(&[0.0; 3], &[8.0, 0.0, 0.0], &[0.0; 3], &[0.0; 3], -1, MASK_SOLID);
        assert!(tr.startsolid && tr.allsolid);
    }

    #[test]
    fn test_position_test_inside_and_outside() {
        let cm = CollisionModel::from_boxes(&[cube(32.0)]).unwrap();
        let inside = cm.box_trace(&[40.0, 0.0, 0.0], &[40.0, 0.0, 0.0], &[-16.0; 3], &[16.0; 3], -1, MASK_SOLID);
        assert!(inside.startsolid && inside.allsolid);
        assert_eq!(inside.fraction, 0.0);
        assert_eq!(inside.endpos, [40.0, 0.0, 0.0]);

        let outside = cm.box_trace(&[50.0, 0.0, 0.0], &[50.0, 0.0, 0.0], &[-16.0; 3], &[16.0; 3], -1, MASK_SOLID);
        assert!(!outside.startsolid);
        assert_eq!(outside.fraction, 1.0);
    }

    #[test]
    fn test_content_mask_filters_brushes() {
        let cm = CollisionModel::from_boxes(&[([-32.0; 3], [32.0; 3], Contents::WATER)]).unwrap();
        let start = [-64.0, 0.0, 0.0];
        let end = [64.0, 0.0, 0.0];
        let tr = cm.box_trace(&start, &end, &[0.0; 3], &[0.0; 3], -1, MASK_SOLID);
        assert_eq!(tr.fraction, 1.0, "water is not in MASK_SOLID");
        let tr = cm.box_trace(&start, &end, &[0.0; 3], &[0.0; 3], -1, Contents::WATER);
        assert!(tr.fraction < 1.0);
        assert_eq!(tr.contents, Contents::WATER);
    }

    #[test]
    fn test_nearest_of_two_brushes_wins() {
        let cm = CollisionModel::from_boxes(&[
            ([40.0, -8.0, -8.0], [48.0, 8.0, 8.0], Contents::SOLID),
            ([16.0, -8.0, -8.0], [24.0, 8.0, 8.0], Contents::WINDOW),
        ])
        .unwrap();
        let tr = cm.box_trace(&[0.0; 3], &[64.0, 0.0, 0.0], &[0.0; 3], &[0.0; 3], -1, MASK_SOLID);
        assert!((tr.endpos[0] - (16.0 - DIST_EPSILON)).abs() < EPS);
        assert_eq!(tr.contents, Contents::WINDOW);
    }

    #[test]
    fn test_custom_epsilon() {
        let cm = CollisionModel::from_boxes(&[cube(32.0)]).unwrap().with_dist_epsilon(0.0);
        let tr = cm.box_trace(&[-64.0, 0.0, 0.0], &[64.0, 0.0, 0.0], &[0.0; 3], &[0.0; 3], -1, MASK_SOLID);
        assert!((tr.endpos[0] + 32.0).abs() < EPS);
    }

    // =========================================================================
    // Tracing through a tree
    // =========================================================================

    #[test]
    fn test_tree_trace_reaches_far_leaf() {
        let cm = make_split_model();
        let tr = cm.box_trace(&[-32.0, 0.0, 0.0], &[200.0, 0.0, 0.0], &[0.0; 3], &[0.0; 3], 0, MASK_SOLID);
        assert!((tr.endpos[0] - (64.0 - DIST_EPSILON)).abs() < EPS, "endpos = {:?}", tr.endpos);
    }

    #[test]
    fn test_tree_trace_near_side_blocks_first() {
        let cm = make_split_model();
        let mask = Contents::SOLID | Contents::WATER;
        let tr = cm.box_trace(&[-32.0, 0.0, 0.0], &[-200.0, 0.0, 0.0], &[-4.0; 3], &[4.0; 3], 0, mask);
        assert_eq!(tr.contents, Contents::WATER);
        assert!((tr.endpos[0] - (-60.0 + DIST_EPSILON)).abs() < EPS, "endpos = {:?}", tr.endpos);
    }

    #[test]
    fn test_tree_trace_within_one_child() {
        let cm = make_split_model();
        // sweep stays entirely in front of the split plane
        let tr = cm.box_trace(&[90.0, -100.0, 0.0], &[90.0, 100.0, 0.0], &[-8.0; 3], &[8.0; 3], 0, MASK_SOLID);
        assert!((tr.endpos[1] - (-40.0 - DIST_EPSILON)).abs() < EPS, "endpos = {:?}", tr.endpos);
        assert_eq!(tr.plane.normal, [0.0, -1.0, 0.0]);
    }

    #[test]
    fn test_point_contents_in_tree() {
        let cm = make_split_model();
        assert_eq!(cm.point_contents(&[100.0, 0.0, 0.0], 0), Contents::SOLID);
        assert_eq!(cm.point_contents(&[-100.0, 0.0, 0.0], 0), Contents::WATER);
        assert_eq!(cm.point_contents(&[30.0, 0.0, 0.0], 0), Contents::empty());
        assert_eq!(cm.point_leafnum(&[30.0, 0.0, 0.0], 0), 1);
        assert_eq!(cm.point_leafnum(&[-30.0, 0.0, 0.0], 0), 2);
    }

    #[test]
    fn test_box_leafnums_reports_topnode() {
        let cm = make_split_model();
        let (leafs, top) = cm.box_leafnums(&[-8.0; 3], &[8.0; 3], 0, 16);
        assert_eq!(leafs, vec![1, 2]);
        assert_eq!(top, Some(0));
        let (leafs, top) = cm.box_leafnums(&[8.0; 3], &[16.0; 3], 0, 16);
        assert_eq!(leafs, vec![1]);
        assert_eq!(top, None);
    }

    #[test]
    fn test_translation_consistency() {
        let cm = CollisionModel::from_boxes(&[cube(32.0), ([40.0, -64.0, -8.0], [56.0, 64.0, 8.0], Contents::SOLID)])
            .unwrap();
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..64 {
            let start: Vec3 = [rng.gen_range(-200.0..-80.0), rng.gen_range(-16.0..16.0), rng.gen_range(-16.0..16.0)];
            let end: Vec3 = [rng.gen_range(80.0..200.0), rng.gen_range(-16.0..16.0), rng.gen_range(-16.0..16.0)];
            let delta: Vec3 = [rng.gen_range(-512.0..512.0), rng.gen_range(-512.0..512.0), 0.0];

            let base = cm.box_trace(&start, &end, &[-4.0; 3], &[4.0; 3], -1, MASK_SOLID);
            let moved_start = [start[0] + delta[0], start[1] + delta[1], start[2]];
            let moved_end = [end[0] + delta[0], end[1] + delta[1], end[2]];
            let moved = cm.transformed_box_trace(&moved_start, &moved_end, &[-4.0; 3], &[4.0; 3], -1, MASK_SOLID, &delta);

            assert!(
                (base.fraction - moved.fraction).abs() < 1e-3,
                "fraction {} vs {} for delta {:?}",
                base.fraction,
                moved.fraction,
                delta
            );
            assert_eq!(base.plane.normal, moved.plane.normal);
            assert!((moved.endpos[0] - delta[0] - base.endpos[0]).abs() < 1e-2);
        }
    }

    // =========================================================================
    // Inline models and box brushes
    // =========================================================================

    #[test]
    fn test_brush_list_submodel() {
        let mut lumps = CollisionLumps::default();
        let brush = BoxBrush::new(&[-8.0; 3], &[8.0; 3], Contents::SOLID);
        for plane in brush.planes.iter() {
            lumps.brushsides.push(CBrushSide { plane_idx: lumps.planes.len(), ..Default::default() });
            lumps.planes.push(PlaneLump { normal: plane.normal, dist: plane.dist });
        }
        lumps.brushes.push(CBrush { contents: Contents::SOLID, firstbrushside: 0, numsides: 6 });
        lumps.leafs.push(CLeaf::default());
        lumps.submodels = vec![
            CModel { mins: [0.0; 3], maxs: [0.0; 3], origin: [0.0; 3], hull: SubModelHull::Tree { headnode: -1 } },
            CModel { mins: [-8.0; 3], maxs: [8.0; 3], origin: [0.0; 3], hull: SubModelHull::Brushes(vec![0]) },
        ];
        let cm = CollisionModel::from_lumps(lumps).unwrap();
        assert_eq!(cm.num_inline_models(), 2);

        // the world leaf has no brushes, so only the inline model blocks
        let world = cm.trace_model(0, &[-64.0, 0.0, 0.0], &[64.0, 0.0, 0.0], &[0.0; 3], &[0.0; 3], MASK_SOLID);
        assert_eq!(world.fraction, 1.0);

        let origin = [100.0, 0.0, 0.0];
        let tr = cm.transformed_trace_model(1, &[0.0; 3], &[200.0, 0.0, 0.0], &[0.0; 3], &[0.0; 3], MASK_SOLID, &origin);
        assert!((tr.endpos[0] - (92.0 - DIST_EPSILON)).abs() < EPS, "endpos = {:?}", tr.endpos);
        assert!((tr.plane.dist - -92.0).abs() < EPS, "plane moved with the model");

        assert_eq!(cm.transformed_point_contents(&[101.0, 0.0, 0.0], 1, &origin), Contents::SOLID);
        assert_eq!(cm.transformed_point_contents(&[1.0, 0.0, 0.0], 1, &origin), Contents::empty());
    }

    #[test]
    fn test_unknown_model_never_blocks() {
        let cm = CollisionModel::empty();
        let end = [1.0, 2.0, 3.0];
        let tr = cm.trace_model(7, &[0.0; 3], &end, &[0.0; 3], &[0.0; 3], MASK_ALL);
        assert_eq!(tr.fraction, 1.0);
        assert_eq!(tr.endpos, end);
    }

    #[test]
    fn test_box_brush_trace_and_contains() {
        let cm = CollisionModel::empty();
        let brush = BoxBrush::new(&[-88.0, -8.0, -8.0], &[-72.0, 8.0, 8.0], Contents::MONSTER);
        assert!(brush.contains_point(&[-80.0, 0.0, 0.0]));
        assert!(!brush.contains_point(&[-60.0, 0.0, 0.0]));

        let tr = cm.trace_box_brush(&brush, &[-80.0, 0.0, 0.0], &[96.0, 0.0, 0.0], &[0.0; 3], &[0.0; 3]);
        assert!(tr.startsolid, "start is inside the box");

        let tr = cm.trace_box_brush(&brush, &[-200.0, 0.0, 0.0], &[0.0, 0.0, 0.0], &[0.0; 3], &[0.0; 3]);
        assert!((tr.endpos[0] - (-88.0 - DIST_EPSILON)).abs() < EPS);
        assert_eq!(tr.plane.normal, [-1.0, 0.0, 0.0]);
        assert_eq!(tr.contents, Contents::MONSTER);

        let tr = cm.trace_box_brush(&brush, &[-80.0, 0.0, 0.0], &[-80.0, 0.0, 0.0], &[-1.0; 3], &[1.0; 3]);
        assert!(tr.allsolid && tr.startsolid);
    }
}
