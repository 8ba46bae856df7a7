// cl_pred.rs -- client-side movement prediction

use pmcore_common::pmove::{pmove, PmoveCallbacks, PmoveOutcome, PmoveTunables};
use pmcore_common::q_shared::*;

/// Commands kept for replay. Must be a power of two.
pub const CMD_BACKUP: usize = 64;

/// Total miss, in world units, above which a correction is treated as a
/// teleport and not smoothed.
const TELEPORT_DISTANCE: f32 = 80.0;

/// How long a stair step is smoothed out of the view, in ms.
const STEP_SMOOTH_MSEC: u32 = 100;

/// Ring of sent commands and the origins predicted for them, indexed by
/// sequence number.
#[derive(Debug, Clone)]
pub struct CommandBuffer {
    cmds: [UserCmd; CMD_BACKUP],
    predicted_origins: [Vec3; CMD_BACKUP],
    sequence: i32,
}

impl Default for CommandBuffer {
    fn default() -> Self {
        Self {
            cmds: [UserCmd::default(); CMD_BACKUP],
            predicted_origins: [[0.0; 3]; CMD_BACKUP],
            sequence: 0,
        }
    }
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(sequence: i32) -> usize {
        sequence.rem_euclid(CMD_BACKUP as i32) as usize
    }

    /// Store the next command and return its sequence number.
    pub fn push(&mut self, cmd: UserCmd) -> i32 {
        self.sequence += 1;
        self.cmds[Self::slot(self.sequence)] = cmd;
        self.sequence
    }

    /// Sequence number of the newest command.
    pub fn sequence(&self) -> i32 {
        self.sequence
    }

    pub fn get(&self, sequence: i32) -> &UserCmd {
        &self.cmds[Self::slot(sequence)]
    }

    pub fn predicted_origin(&self, sequence: i32) -> &Vec3 {
        &self.predicted_origins[Self::slot(sequence)]
    }
}

/// Prediction results the view is built from.
#[derive(Debug, Clone, Default)]
pub struct ClientPrediction {
    pub cmds: CommandBuffer,
    pub predicted_origin: Vec3,
    pub predicted_angles: Vec3,
    /// Height of the last stair climbed, for view smoothing.
    pub predicted_step: f32,
    pub predicted_step_time: u32,
    pub prediction_error: Vec3,
}

impl ClientPrediction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare the server's origin for the acknowledged command with what we
    /// predicted. A small miss is kept for interpolation; a large one
    /// (teleport) is dropped.
    pub fn check_prediction_error(&mut self, incoming_acknowledged: i32, server: &PmoveState) {
        if server.pm_flags.contains(PmFlags::NO_PREDICTION) {
            return;
        }

        let slot = CommandBuffer::slot(incoming_acknowledged);
        let delta = vector_subtract(&server.origin, &self.cmds.predicted_origins[slot]);

        let len = delta[0].abs() + delta[1].abs() + delta[2].abs();
        if len > TELEPORT_DISTANCE {
            self.prediction_error = [0.0; 3];
            return;
        }

        if len != 0.0 {
            log::debug!("prediction miss on {}: {:?}", incoming_acknowledged, delta);
        }

        // copy corrected origin back
        self.cmds.predicted_origins[slot] = server.origin;
        self.prediction_error = delta;
    }

    /// Replay every command the server has not acknowledged on top of its
    /// last state. Returns the outcome of the newest command, or `None`
    /// when nothing was replayed.
    pub fn predict_movement(
        &mut self,
        server: &PmoveState,
        incoming_acknowledged: i32,
        viewangles: &Vec3,
        tunables: &PmoveTunables,
        callbacks: &impl PmoveCallbacks,
        realtime: u32,
    ) -> Option<PmoveOutcome> {
        if server.pm_flags.contains(PmFlags::NO_PREDICTION) {
            // just set angles
            for i in 0..3 {
                self.predicted_angles[i] = viewangles[i] + short2angle(server.delta_angles[i]);
            }
            return None;
        }

        let current = self.cmds.sequence();

        // if we are too far out of date, just freeze
        if current - incoming_acknowledged >= CMD_BACKUP as i32 {
            log::warn!("exceeded CMD_BACKUP");
            return None;
        }

        let mut state = *server;
        let mut last: Option<(PmoveOutcome, u8)> = None;
        for sequence in incoming_acknowledged + 1..=current {
            let cmd = *self.cmds.get(sequence);
            let outcome = pmove(&state, &cmd, tunables, callbacks);
            state = outcome.state;
            self.cmds.predicted_origins[CommandBuffer::slot(sequence)] = state.origin;
            last = Some((outcome, cmd.msec));
        }

        let Some((outcome, msec)) = last else {
            self.predicted_origin = server.origin;
            return None;
        };

        // smooth out stair climbing
        let step = state.origin[2] - self.predicted_origin[2];
        let moving = state.velocity[0] != 0.0 || state.velocity[1] != 0.0;
        if state.pm_flags.contains(PmFlags::ON_GROUND) && moving && step > 7.0 && step < 17.0 {
            self.predicted_step = step;
            self.predicted_step_time = realtime.saturating_sub(msec as u32 / 2);
        }

        self.predicted_origin = state.origin;
        self.predicted_angles = outcome.viewangles;
        Some(outcome)
    }

    /// Eye-level origin for rendering: the prediction minus the part of the
    /// last miss not yet interpolated away, with any recent step eased in.
    pub fn view_origin(&self, realtime: u32, backlerp: f32) -> Vec3 {
        let mut origin = vector_ma(&self.predicted_origin, -backlerp, &self.prediction_error);

        let delta = realtime.saturating_sub(self.predicted_step_time);
        if delta < STEP_SMOOTH_MSEC {
            origin[2] -= self.predicted_step * (STEP_SMOOTH_MSEC - delta) as f32 * 0.01;
        }
        origin
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmcore_common::cmodel::CollisionModel;

    struct BoxWorld {
        cm: CollisionModel,
    }

    impl BoxWorld {
        fn new(boxes: &[(Vec3, Vec3, Contents)]) -> Self {
            Self { cm: CollisionModel::from_boxes(boxes).expect("test world should build") }
        }
    }

    impl PmoveCallbacks for BoxWorld {
        fn trace(&self, start: &Vec3, mins: &Vec3, maxs: &Vec3, end: &Vec3) -> Trace {
            self.cm.box_trace(start, end, mins, maxs, -1, MASK_PLAYERSOLID)
        }

        fn pointcontents(&self, point: &Vec3) -> Contents {
            self.cm.point_contents(point, -1)
        }
    }

    const FLOOR: (Vec3, Vec3, Contents) = ([-512.0, -512.0, -64.0], [512.0, 512.0, 0.0], Contents::SOLID);

    fn standing() -> PmoveState {
        PmoveState {
            origin: [0.0, 0.0, 24.125],
            pm_flags: PmFlags::ON_GROUND,
            ..PmoveState::default()
        }
    }

    fn forward(msec: u8) -> UserCmd {
        UserCmd { msec, forwardmove: 300, ..UserCmd::default() }
    }

    #[test]
    fn test_command_buffer_wraps() {
        let mut buf = CommandBuffer::new();
        for i in 1..=70u8 {
            assert_eq!(buf.push(UserCmd { msec: i, ..UserCmd::default() }), i as i32);
        }
        assert_eq!(buf.sequence(), 70);
        assert_eq!(buf.get(70).msec, 70);
        assert_eq!(buf.get(7).msec, 7);
        assert_eq!(buf.get(6).msec, 70, "slot reused after CMD_BACKUP commands");
    }

    #[test]
    fn test_replay_matches_server() {
        let world = BoxWorld::new(&[FLOOR]);
        let tunables = PmoveTunables::default();
        let mut pred = ClientPrediction::new();
        for _ in 0..3 {
            pred.cmds.push(forward(16));
        }

        let mut server = standing();
        for seq in 1..=3 {
            server = pmove(&server, pred.cmds.get(seq), &tunables, &world).state;
        }

        let out = pred.predict_movement(&standing(), 0, &[0.0; 3], &tunables, &world, 100);
        assert!(out.is_some());
        assert_eq!(pred.predicted_origin, server.origin);
        assert_eq!(pred.cmds.predicted_origin(3), &server.origin);

        // the server acknowledges the first two; replaying the rest agrees
        let mut acked = standing();
        for seq in 1..=2 {
            acked = pmove(&acked, pred.cmds.get(seq), &tunables, &world).state;
        }
        pred.predict_movement(&acked, 2, &[0.0; 3], &tunables, &world, 116);
        assert_eq!(pred.predicted_origin, server.origin);
    }

    #[test]
    fn test_nothing_outstanding_uses_server_origin() {
        let world = BoxWorld::new(&[FLOOR]);
        let mut pred = ClientPrediction::new();
        pred.cmds.push(forward(16));
        let server = PmoveState { origin: [8.0, 0.0, 24.125], ..standing() };
        let out = pred.predict_movement(&server, 1, &[0.0; 3], &PmoveTunables::default(), &world, 0);
        assert!(out.is_none());
        assert_eq!(pred.predicted_origin, server.origin);
    }

    #[test]
    fn test_out_of_date_freezes() {
        let world = BoxWorld::new(&[FLOOR]);
        let mut pred = ClientPrediction::new();
        for _ in 0..CMD_BACKUP {
            pred.cmds.push(forward(16));
        }
        pred.predicted_origin = [1.0, 2.0, 3.0];
        let out = pred.predict_movement(&standing(), 0, &[0.0; 3], &PmoveTunables::default(), &world, 0);
        assert!(out.is_none());
        assert_eq!(pred.predicted_origin, [1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_no_prediction_sets_angles_only() {
        let world = BoxWorld::new(&[FLOOR]);
        let mut pred = ClientPrediction::new();
        pred.cmds.push(forward(16));
        let mut server = standing();
        server.pm_flags |= PmFlags::NO_PREDICTION;
        server.delta_angles = [0, angle2short(90.0), 0];

        let out = pred.predict_movement(&server, 0, &[0.0, 10.0, 0.0], &PmoveTunables::default(), &world, 0);
        assert!(out.is_none());
        assert_eq!(pred.predicted_angles, [0.0, 100.0, 0.0]);
        assert_eq!(pred.predicted_origin, [0.0; 3]);
    }

    #[test]
    fn test_stair_step_is_smoothed() {
        let world = BoxWorld::new(&[FLOOR, ([32.0, -256.0, -64.0], [256.0, 256.0, 16.0], Contents::SOLID)]);
        let mut pred = ClientPrediction::new();
        let mut server = standing();
        server.velocity = [300.0, 0.0, 0.0];
        pred.predicted_origin = server.origin;
        pred.cmds.push(forward(100));

        pred.predict_movement(&server, 0, &[0.0; 3], &PmoveTunables::default(), &world, 1000);
        assert_eq!(pred.predicted_origin, [30.0, 0.0, 40.125]);
        assert_eq!(pred.predicted_step, 16.0);
        assert_eq!(pred.predicted_step_time, 950);

        let eased = pred.view_origin(1000, 0.0);
        assert!((eased[2] - 32.125).abs() < 0.001, "eased = {:?}", eased);
        assert_eq!(pred.view_origin(1050, 0.0), pred.predicted_origin);
    }

    #[test]
    fn test_small_miss_is_recorded() {
        let mut pred = ClientPrediction::new();
        pred.cmds.predicted_origins[CommandBuffer::slot(5)] = [10.0, 0.0, 24.125];
        let server = PmoveState { origin: [11.0, 0.0, 24.125], ..standing() };

        pred.check_prediction_error(5, &server);
        assert_eq!(pred.prediction_error, [1.0, 0.0, 0.0]);
        assert_eq!(pred.cmds.predicted_origin(5), &server.origin, "corrected in place");

        pred.predicted_origin = [11.0, 0.0, 24.125];
        assert_eq!(pred.view_origin(0, 0.5)[0], 10.5);
    }

    #[test]
    fn test_teleport_clears_error() {
        let mut pred = ClientPrediction::new();
        pred.prediction_error = [5.0, 5.0, 5.0];
        let server = PmoveState { origin: [500.0, 0.0, 24.125], ..standing() };
        pred.check_prediction_error(5, &server);
        assert_eq!(pred.prediction_error, [0.0; 3]);
    }

    #[test]
    fn test_miss_just_under_teleport_distance() {
        let mut pred = ClientPrediction::new();
        let server = PmoveState { origin: [80.0, 0.0, 0.0], ..standing() };
        pred.check_prediction_error(9, &server);
        assert_eq!(pred.prediction_error, [80.0, 0.0, 0.0]);
    }
}
