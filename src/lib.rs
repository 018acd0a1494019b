pub mod activity;
pub mod astro_util;
pub mod poller;
pub mod hardware;
pub mod paths;

pub mod mount;
pub mod camera;
pub mod focuser;
pub mod stage;
pub mod covers;

pub mod solver_client;
pub mod correction;
pub mod guide_stats;
pub mod image_shift;
pub mod guiding;
pub mod autofocus;
pub mod acquisition;
pub mod unit;

pub mod simulator;
pub mod solver_sim;
