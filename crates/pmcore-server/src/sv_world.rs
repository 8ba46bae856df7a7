// sv_world.rs -- world query functions
//
// Entity area checking: spatial partitioning via area nodes,
// linking/unlinking entities, box queries, point contents, and tracing.

use std::collections::BTreeMap;

use pmcore_common::cmodel::{BoxBrush, CollisionModel};
use pmcore_common::pmove::PmoveCallbacks;
use pmcore_common::q_shared::*;

// ===============================================================================
// ENTITY AREA CHECKING
// ===============================================================================

const AREA_DEPTH: i32 = 4;
const AREA_NODES: usize = 32;
pub const MAX_AREA_ENTITIES: usize = 1024;

/// Which list of an area node a query walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AreaKind {
    Solid,
    Triggers,
}

// ============================================================
// Area node (spatial partitioning BSP for entities)
// ============================================================

#[derive(Debug, Clone)]
pub struct AreaNode {
    pub axis: i32, // -1 = leaf node
    pub dist: f32,
    pub children: [usize; 2], // indices into SvWorldContext::areanodes
    pub trigger_ents: Vec<EntityId>,
    pub solid_ents: Vec<EntityId>,
}

impl Default for AreaNode {
    fn default() -> Self {
        Self {
            axis: -1,
            dist: 0.0,
            children: [usize::MAX; 2],
            trigger_ents: Vec::new(),
            solid_ents: Vec::new(),
        }
    }
}

// ============================================================
// Entity links
// ============================================================

/// What the world index knows about an entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityLink {
    pub id: EntityId,
    pub origin: Vec3,
    pub mins: Vec3,
    pub maxs: Vec3,
    pub contents: Contents,
    pub owner: Option<EntityId>,
    /// Inline brush model clipped instead of the box (doors, lifts).
    pub model: Option<usize>,
}

impl EntityLink {
    /// A solid bounding box entity.
    pub fn bbox(id: EntityId, origin: Vec3, mins: Vec3, maxs: Vec3, contents: Contents) -> Self {
        Self { id, origin, mins, maxs, contents, owner: None, model: None }
    }
}

#[derive(Debug, Clone)]
struct LinkedEntity {
    link: EntityLink,
    absmin: Vec3,
    absmax: Vec3,
    area_node: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkError {
    /// `clear_world` has not built the area tree yet.
    NoAreaTree,
    NonFinite { id: EntityId },
    /// A box entity with maxs not above mins on some axis.
    BadBounds { id: EntityId },
    UnknownModel { id: EntityId, model: usize },
}

impl std::fmt::Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkError::NoAreaTree => write!(f, "link before clear_world"),
            LinkError::NonFinite { id } => write!(f, "entity {}: non-finite origin or bounds", id),
            LinkError::BadBounds { id } => write!(f, "entity {}: box has no volume", id),
            LinkError::UnknownModel { id, model } => {
                write!(f, "entity {}: no inline model {}", id, model)
            }
        }
    }
}

impl std::error::Error for LinkError {}

/// Result of an area query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AreaQuery {
    /// Overlapping entities, ascending.
    pub ents: Vec<EntityId>,
    /// Links examined while walking the tree.
    pub tested: usize,
}

// ============================================================
// MoveClip: internal trace structure
// ============================================================

struct MoveClip<'a> {
    boxmins: Vec3,
    boxmaxs: Vec3,
    mins: &'a Vec3,
    maxs: &'a Vec3,
    start: &'a Vec3,
    end: &'a Vec3,
    pass: Option<EntityId>,
    contentmask: Contents,
}

// ============================================================
// SvWorldContext
// ============================================================

#[derive(Debug, Clone, Default)]
pub struct SvWorldContext {
    pub areanodes: Vec<AreaNode>,
    pub numareanodes: usize,
    entities: BTreeMap<EntityId, LinkedEntity>,
}

impl SvWorldContext {
    pub fn new() -> Self {
        Self::default()
    }

    // ================================================================
    // create_area_node
    //
    // Builds a uniformly subdivided tree for the given world size.
    // Returns the index of the created node.
    // ================================================================
    fn create_area_node(&mut self, depth: i32, mins: &Vec3, maxs: &Vec3) -> usize {
        let anode_idx = self.numareanodes;
        self.numareanodes += 1;

        if anode_idx >= self.areanodes.len() {
            self.areanodes.push(AreaNode::default());
        } else {
            self.areanodes[anode_idx] = AreaNode::default();
        }

        if depth == AREA_DEPTH {
            return anode_idx;
        }

        let size = vector_subtract(maxs, mins);
        let axis = if size[0] > size[1] { 0 } else { 1 };
        let dist = 0.5 * (maxs[axis] + mins[axis]);
        self.areanodes[anode_idx].axis = axis as i32;
        self.areanodes[anode_idx].dist = dist;

        let mins1 = *mins;
        let mut mins2 = *mins;
        let mut maxs1 = *maxs;
        let maxs2 = *maxs;

        maxs1[axis] = dist;
        mins2[axis] = dist;

        let child0 = self.create_area_node(depth + 1, &mins2, &maxs2);
        let child1 = self.create_area_node(depth + 1, &mins1, &maxs1);

        self.areanodes[anode_idx].children = [child0, child1];

        anode_idx
    }

    // ================================================================
    // clear_world
    // ================================================================
    pub fn clear_world(&mut self, world_mins: &Vec3, world_maxs: &Vec3) {
        self.areanodes.clear();
        self.areanodes.resize(AREA_NODES, AreaNode::default());
        self.numareanodes = 0;
        self.entities.clear();
        self.create_area_node(0, world_mins, world_maxs);
    }

    pub fn entity(&self, id: EntityId) -> Option<&EntityLink> {
        self.entities.get(&id).map(|e| &e.link)
    }

    pub fn num_linked(&self) -> usize {
        self.entities.len()
    }

    // ================================================================
    // unlink
    // ================================================================
    pub fn unlink(&mut self, id: EntityId) -> bool {
        let Some(ent) = self.entities.remove(&id) else {
            return false; // not linked in anywhere
        };

        if let Some(node) = self.areanodes.get_mut(ent.area_node) {
            node.trigger_ents.retain(|&e| e != id);
            node.solid_ents.retain(|&e| e != id);
        }
        true
    }

    // ================================================================
    // link
    // ================================================================
    pub fn link(&mut self, cm: &CollisionModel, mut link: EntityLink) -> Result<(), LinkError> {
        if self.numareanodes == 0 {
            return Err(LinkError::NoAreaTree);
        }

        let id = link.id;
        let finite = link.origin.iter().chain(&link.mins).chain(&link.maxs).all(|v| v.is_finite());
        if !finite {
            return Err(LinkError::NonFinite { id });
        }

        match link.model {
            Some(model) => {
                // brush models take their bounds from the collision model
                let cmodel = cm.inline_model(model).ok_or(LinkError::UnknownModel { id, model })?;
                link.mins = cmodel.mins;
                link.maxs = cmodel.maxs;
            }
            None => {
                if (0..3).any(|i| link.maxs[i] <= link.mins[i]) {
                    return Err(LinkError::BadBounds { id });
                }
            }
        }

        self.unlink(id); // unlink from old position

        // set the abs box
        let mut absmin = vector_add(&link.origin, &link.mins);
        let mut absmax = vector_add(&link.origin, &link.maxs);

        // because movement is clipped an epsilon away from an actual edge,
        // we must fully check even when bounding boxes don't quite touch
        for i in 0..3 {
            absmin[i] -= 1.0;
            absmax[i] += 1.0;
        }

        // find the first node that the ent's box crosses
        let mut node_idx: usize = 0;
        loop {
            let node = &self.areanodes[node_idx];
            if node.axis == -1 {
                break;
            }
            let axis = node.axis as usize;
            if absmin[axis] > node.dist {
                node_idx = node.children[0];
            } else if absmax[axis] < node.dist {
                node_idx = node.children[1];
            } else {
                break; // crosses the node
            }
        }

        // link it in
        if link.contents.contains(Contents::TRIGGER) {
            self.areanodes[node_idx].trigger_ents.push(id);
        } else {
            self.areanodes[node_idx].solid_ents.push(id);
        }

        self.entities.insert(id, LinkedEntity { link, absmin, absmax, area_node: node_idx });
        Ok(())
    }

    // ================================================================
    // area_entities_r
    // ================================================================
    fn area_entities_r(
        &self,
        node_idx: usize,
        area_mins: &Vec3,
        area_maxs: &Vec3,
        kind: AreaKind,
        query: &mut AreaQuery,
    ) {
        let node = &self.areanodes[node_idx];

        // touch linked entities
        let list = match kind {
            AreaKind::Solid => &node.solid_ents,
            AreaKind::Triggers => &node.trigger_ents,
        };

        for id in list {
            let Some(check) = self.entities.get(id) else {
                continue;
            };
            query.tested += 1;

            if !boxes_overlap(&check.absmin, &check.absmax, area_mins, area_maxs) {
                continue; // not touching
            }

            if query.ents.len() == MAX_AREA_ENTITIES {
                log::warn!("area_entities: MAXCOUNT");
                return;
            }

            query.ents.push(*id);
        }

        if node.axis == -1 {
            return; // terminal node
        }

        // recurse down both sides
        let axis = node.axis as usize;
        if area_maxs[axis] > node.dist {
            self.area_entities_r(node.children[0], area_mins, area_maxs, kind, query);
        }
        if area_mins[axis] < node.dist {
            self.area_entities_r(node.children[1], area_mins, area_maxs, kind, query);
        }
    }

    // ================================================================
    // area_entities
    // ================================================================
    pub fn area_entities(&self, mins: &Vec3, maxs: &Vec3, kind: AreaKind) -> AreaQuery {
        let mut query = AreaQuery::default();
        if self.numareanodes > 0 {
            self.area_entities_r(0, mins, maxs, kind, &mut query);
        }
        query.ents.sort_unstable();
        query
    }

    /// Triggers whose bounds overlap the box, ascending.
    pub fn gather_trigger_touches(&self, mins: &Vec3, maxs: &Vec3) -> Vec<EntityId> {
        self.area_entities(mins, maxs, AreaKind::Triggers).ents
    }

    fn entity_box_brush(ent: &LinkedEntity) -> BoxBrush {
        let link = &ent.link;
        BoxBrush::new(
            &vector_add(&link.origin, &link.mins),
            &vector_add(&link.origin, &link.maxs),
            link.contents,
        )
    }

    // ================================================================
    // point_contents
    // ================================================================
    pub fn point_contents(&self, cm: &CollisionModel, p: &Vec3) -> Contents {
        // get base contents from world
        let mut contents = cm.point_contents(p, cm.world_headnode());

        // or in contents from all the other entities
        for id in self.area_entities(p, p, AreaKind::Solid).ents {
            let Some(hit) = self.entities.get(&id) else {
                continue;
            };

            // might intersect, so do an exact clip
            contents |= match hit.link.model {
                Some(model) => cm.transformed_point_contents(p, model, &hit.link.origin),
                None if Self::entity_box_brush(hit).contains_point(p) => hit.link.contents,
                None => Contents::empty(),
            };
        }

        contents
    }

    // ================================================================
    // clip_move_to_entities
    // ================================================================
    fn clip_move_to_entities(&self, cm: &CollisionModel, clip: &MoveClip, mut best: Trace) -> Trace {
        let touchlist = self.area_entities(&clip.boxmins, &clip.boxmaxs, AreaKind::Solid);
        let pass_owner = clip.pass.and_then(|p| self.entities.get(&p)).and_then(|p| p.link.owner);

        for id in touchlist.ents {
            let Some(touch) = self.entities.get(&id) else {
                continue;
            };

            if !touch.link.contents.intersects(clip.contentmask) {
                continue;
            }
            if Some(id) == clip.pass {
                continue;
            }
            if best.allsolid {
                return best;
            }
            if clip.pass.is_some() {
                if touch.link.owner == clip.pass {
                    continue; // don't clip against own missiles
                }
                if pass_owner == Some(id) {
                    continue; // don't clip against owner
                }
            }

            // might intersect, so do an exact clip
            let mut trace = match touch.link.model {
                Some(model) => cm.transformed_trace_model(
                    model,
                    clip.start,
                    clip.end,
                    clip.mins,
                    clip.maxs,
                    clip.contentmask,
                    &touch.link.origin,
                ),
                None => {
                    let brush = Self::entity_box_brush(touch);
                    cm.trace_box_brush(&brush, clip.start, clip.end, clip.mins, clip.maxs)
                }
            };

            trace.ent = Some(id);
            if trace.fraction < best.fraction {
                let (startsolid, allsolid) = (best.startsolid, best.allsolid);
                best = trace;
                best.startsolid |= startsolid;
                best.allsolid |= allsolid;
            } else if trace.startsolid || trace.allsolid {
                // embedded, but the nearer hit still decides where the move stops
                best.startsolid = true;
                best.allsolid |= trace.allsolid;
                if best.ent.is_none() && best.fraction == 1.0 {
                    best.ent = Some(id);
                }
            }
        }
        best
    }

    // ================================================================
    // trace_bounds
    // ================================================================
    fn trace_bounds(start: &Vec3, mins: &Vec3, maxs: &Vec3, end: &Vec3) -> (Vec3, Vec3) {
        let mut boxmins = [0.0; 3];
        let mut boxmaxs = [0.0; 3];
        for i in 0..3 {
            if end[i] > start[i] {
                boxmins[i] = start[i] + mins[i] - 1.0;
                boxmaxs[i] = end[i] + maxs[i] + 1.0;
            } else {
                boxmins[i] = end[i] + mins[i] - 1.0;
                boxmaxs[i] = start[i] + maxs[i] + 1.0;
            }
        }
        (boxmins, boxmaxs)
    }

    // ================================================================
    // trace
    //
    // Moves the given mins/maxs volume through the world from start to end.
    // The pass entity and entities owned by it are explicitly not checked.
    // ================================================================
    #[allow(clippy::too_many_arguments)]
    pub fn trace(
        &self,
        cm: &CollisionModel,
        start: &Vec3,
        mins: &Vec3,
        maxs: &Vec3,
        end: &Vec3,
        pass: Option<EntityId>,
        contentmask: Contents,
    ) -> Trace {
        // clip to world
        let mut trace = cm.box_trace(start, end, mins, maxs, cm.world_headnode(), contentmask);
        trace.ent = None;
        if trace.fraction == 0.0 {
            return trace; // blocked by the world
        }

        // create the bounding box of the entire move
        let (boxmins, boxmaxs) = Self::trace_bounds(start, mins, maxs, end);
        let clip = MoveClip { boxmins, boxmaxs, mins, maxs, start, end, pass, contentmask };

        // clip to other solid entities
        self.clip_move_to_entities(cm, &clip, trace)
    }
}

// ============================================================
// Movement callbacks
// ============================================================

/// Traces for one moving entity: skips the entity itself and clips
/// against `mask`.
pub struct WorldClip<'a> {
    pub world: &'a SvWorldContext,
    pub cm: &'a CollisionModel,
    pub pass: Option<EntityId>,
    pub mask: Contents,
}

impl PmoveCallbacks for WorldClip<'_> {
    fn trace(&self, start: &Vec3, mins: &Vec3, maxs: &Vec3, end: &Vec3) -> Trace {
        self.world.trace(self.cm, start, mins, maxs, end, self.pass, self.mask)
    }

    fn pointcontents(&self, point: &Vec3) -> Contents {
        self.world.point_contents(self.cm, point)
    }
}
