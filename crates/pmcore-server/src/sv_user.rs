// sv_user.rs -- server side player movement
//
// Runs client commands through pmove against the linked world, relinks the
// player and reports the triggers it now touches.

use pmcore_common::cmodel::CollisionModel;
use pmcore_common::cvar::{CvarContext, CvarFlags};
use pmcore_common::pmove::{pmove, PmoveOutcome, PmoveTunables};
use pmcore_common::q_shared::*;

use crate::sv_world::{EntityLink, LinkError, SvWorldContext, WorldClip};

/// Movement time a client may spend between budget resets.
pub const COMMAND_MSEC_BUDGET: i32 = 1800;

/// One connected player as the server simulates it.
#[derive(Debug, Clone)]
pub struct SvClient {
    pub id: EntityId,
    pub state: PmoveState,
    /// Remaining movement time; commands that overdraw it are dropped
    /// when `sv_enforcetime` is set.
    pub command_msec: i32,
}

/// What one command did.
#[derive(Debug, Clone, PartialEq)]
pub struct ThinkResult {
    pub outcome: PmoveOutcome,
    pub triggers: Vec<EntityId>,
}

/// Server-wide movement settings.
#[derive(Debug, Clone)]
pub struct SvMovement {
    pub tunables: PmoveTunables,
    pub enforce_time: bool,
}

impl SvMovement {
    /// Register the movement cvars and read their current values.
    pub fn new(cvars: &mut CvarContext) -> Self {
        PmoveTunables::register_cvars(cvars);
        cvars.get("sv_enforcetime", Some("0"), CvarFlags::ARCHIVE);
        cvars.take_modified("pm_");
        cvars.take_modified("sv_enforcetime");
        Self {
            tunables: PmoveTunables::from_cvars(cvars),
            enforce_time: cvars.variable_value("sv_enforcetime") != 0.0,
        }
    }

    /// Pick up changed cvars. Returns true when the tunables changed.
    pub fn check_tunables(&mut self, cvars: &mut CvarContext) -> bool {
        if cvars.take_modified("sv_enforcetime") {
            self.enforce_time = cvars.variable_value("sv_enforcetime") != 0.0;
        }
        if !cvars.take_modified("pm_") {
            return false;
        }
        let tunables = PmoveTunables::from_cvars(cvars);
        if tunables == self.tunables {
            return false;
        }
        log::info!("movement tunables changed: {:?}", tunables);
        self.tunables = tunables;
        true
    }

    /// Place a new player. The first command searches for a free spot
    /// near `origin`.
    pub fn spawn_client(
        &self,
        world: &mut SvWorldContext,
        cm: &CollisionModel,
        id: EntityId,
        origin: Vec3,
    ) -> Result<SvClient, LinkError> {
        let state = PmoveState { origin, snapinitial: true, ..PmoveState::default() };
        let client = SvClient { id, state, command_msec: COMMAND_MSEC_BUDGET };
        world.link(cm, Self::body(&client))?;
        Ok(client)
    }

    pub fn reset_command_budget(client: &mut SvClient) {
        client.command_msec = COMMAND_MSEC_BUDGET;
    }

    fn body(client: &SvClient) -> EntityLink {
        let contents = if client.state.pm_type == PmType::Dead {
            Contents::DEADMONSTER
        } else {
            Contents::PLAYER
        };
        EntityLink::bbox(client.id, client.state.origin, client.state.mins, client.state.maxs, contents)
    }

    /// Run one command. Returns `None` when the command was dropped for
    /// exceeding the time budget.
    pub fn client_think(
        &self,
        world: &mut SvWorldContext,
        cm: &CollisionModel,
        client: &mut SvClient,
        cmd: &UserCmd,
    ) -> Result<Option<ThinkResult>, LinkError> {
        client.command_msec -= cmd.msec as i32;

        if client.command_msec < 0 && self.enforce_time {
            log::debug!("command_msec underflow from {}", client.id);
            return Ok(None);
        }

        let mask = if client.state.pm_type == PmType::Dead {
            MASK_DEADSOLID
        } else {
            MASK_PLAYERSOLID
        };

        let outcome = {
            let clip = WorldClip { world: &*world, cm, pass: Some(client.id), mask };
            pmove(&client.state, cmd, &self.tunables, &clip)
        };
        client.state = outcome.state;

        // spectators don't block or touch anything
        if matches!(client.state.pm_type, PmType::Spectator | PmType::NoClip) {
            world.unlink(client.id);
            return Ok(Some(ThinkResult { outcome, triggers: Vec::new() }));
        }

        world.link(cm, Self::body(client))?;

        let absmin = vector_add(&client.state.origin, &client.state.mins);
        let absmax = vector_add(&client.state.origin, &client.state.maxs);
        let triggers = world.gather_trigger_touches(&absmin, &absmax);

        Ok(Some(ThinkResult { outcome, triggers }))
    }
}
