use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::{error, info, warn};

use kestrel::acquisition::AcquireParams;
use kestrel::astro_util::Coordinate;
use kestrel::autofocus::AutofocusParams;
use kestrel::camera::CameraUnit;
use kestrel::correction::{CorrectionParams, SolvingTolerance};
use kestrel::covers::CoversUnit;
use kestrel::focuser::FocuserUnit;
use kestrel::guiding::GuideParams;
use kestrel::hardware::ExposureSettings;
use kestrel::mount::MountUnit;
use kestrel::paths::PathMaker;
use kestrel::simulator::{Simulator, SimulatorConfig};
use kestrel::solver_sim::{ScriptedSolve, SolverSimConfig, SolverSimulator};
use kestrel::stage::StageUnit;
use kestrel::unit::{Unit, UnitParams};

#[derive(Parser, Debug)]
#[command(author, version, about = "Kestrel unit controller", long_about = None)]
struct Args {
    /// Plate solver endpoint, host:port. Empty runs the embedded solver
    /// simulator.
    #[arg(long, global = true, default_value = "")]
    solver: String,

    /// Root folder for the on-disk session layout.
    #[arg(long, global = true, default_value = "./kestrel_data")]
    data_root: PathBuf,

    /// Device status polling period, seconds.
    #[arg(long, global = true, value_parser = parse_duration,
          default_value = "0.1")]
    poll_period: Duration,

    /// Exposure duration for the solving cameras, seconds.
    #[arg(long, global = true, value_parser = parse_duration,
          default_value = "3.0")]
    exposure: Duration,

    /// Camera binning for the solving exposures.
    #[arg(long, global = true, default_value = "1")]
    binning: u32,

    /// Solving tolerance per axis, arcsec.
    #[arg(long, global = true, default_value = "1.0")]
    tolerance_arcsec: f64,

    /// Simulated pointing error, arcsec, scripted into the embedded solver
    /// simulator's first solve.
    #[arg(long, global = true, default_value = "0.0")]
    sim_ra_error_arcsec: f64,
    #[arg(long, global = true, default_value = "0.0")]
    sim_dec_error_arcsec: f64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start up the unit and idle until Ctrl-C.
    Run {
        /// Home the mount during startup.
        #[arg(long)]
        home_mount: bool,
    },

    /// Acquire a target: position, solve, move to the fiber, solve again,
    /// then guide until Ctrl-C.
    Acquire {
        /// Target right ascension, J2000 degrees.
        ra: f64,

        /// Target declination, J2000 degrees.
        dec: f64,

        /// Stage position exposing the wide field camera path.
        #[arg(long, default_value = "10.0")]
        stage_sky: f64,

        /// Stage position centering the spectrograph fiber.
        #[arg(long, default_value = "85.0")]
        stage_spec: f64,

        /// End the sequence after the fiber solve instead of guiding.
        #[arg(long)]
        no_guide: bool,

        /// Guide cadence, seconds.
        #[arg(long, value_parser = parse_duration, default_value = "30.0")]
        cadence: Duration,
    },

    /// Guide at the current pointing until Ctrl-C.
    Guide {
        /// Guide cadence, seconds.
        #[arg(long, value_parser = parse_duration, default_value = "30.0")]
        cadence: Duration,
    },

    /// Run an autofocus sweep.
    Focus {
        /// Sweep center. Defaults to the stored known focus position,
        /// falling back to the focuser's current position.
        #[arg(long)]
        start_position: Option<i32>,

        /// Focuser ticks between sweep stops.
        #[arg(long, default_value = "50")]
        ticks_per_step: i32,

        /// Number of sweep stops; must be odd.
        #[arg(long, default_value = "5")]
        num_images: u32,
    },

    /// Run a single solve and correct cycle.
    Solve {
        /// Target right ascension, J2000 degrees. Defaults to the current
        /// pointing.
        #[arg(long)]
        ra: Option<f64>,

        /// Target declination, J2000 degrees. Defaults to the current
        /// pointing.
        #[arg(long)]
        dec: Option<f64>,
    },

    /// Print the unit status snapshot as JSON.
    Status,
}

// Adapted from
// https://stackoverflow.com/questions/72313616/using-claps-deriveparser-how-can-i-accept-a-stdtimeduration
fn parse_duration(arg: &str)
                  -> Result<std::time::Duration, std::num::ParseFloatError> {
    let seconds = arg.parse()?;
    Ok(std::time::Duration::from_secs_f32(seconds))
}

fn start_up_or_exit(unit: &Unit, home_mount: bool,
                    cancelled: &dyn Fn() -> bool) {
    let response = unit.startup(home_mount, cancelled);
    if !response.succeeded {
        error!("startup failed: {}", response.errors.join("; "));
        std::process::exit(1);
    }
}

fn shut_down(unit: &Unit, cancelled: &dyn Fn() -> bool) {
    let response = unit.shutdown(cancelled);
    if !response.succeeded {
        error!("shutdown failed: {}", response.errors.join("; "));
    }
}

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let (solver_addr, _embedded_solver) = if args.solver.is_empty() {
        let solver =
            SolverSimulator::start(SolverSimConfig::default()).unwrap();
        if args.sim_ra_error_arcsec != 0.0 || args.sim_dec_error_arcsec != 0.0 {
            solver.push_solve(ScriptedSolve::Deltas {
                ra_arcsec: args.sim_ra_error_arcsec,
                dec_arcsec: args.sim_dec_error_arcsec,
            });
        }
        info!("embedded solver simulator listening at {}", solver.addr());
        (solver.addr(), Some(solver))
    } else {
        (args.solver.clone(), None)
    };

    let sim = Simulator::new(SimulatorConfig::default());
    let camera = Arc::new(CameraUnit::new(
        Box::new(sim.camera()), args.poll_period));
    let mount = Arc::new(MountUnit::new(
        Box::new(sim.mount()), args.poll_period));
    let focuser = Arc::new(FocuserUnit::new(
        Box::new(sim.focuser()), args.poll_period));
    let stage = Arc::new(StageUnit::new(
        Box::new(sim.stage()), args.poll_period));
    let covers = Arc::new(CoversUnit::new(
        Box::new(sim.covers()), args.poll_period));
    let unit = Unit::new(camera, mount.clone(), focuser, stage, covers,
                         &solver_addr, UnitParams::default());

    // First Ctrl-C stops the running session and starts the shutdown; a
    // second abandons the shutdown waits.
    let interrupts = Arc::new(AtomicU32::new(0));
    {
        let interrupts = interrupts.clone();
        ctrlc::set_handler(move || {
            interrupts.fetch_add(1, Ordering::SeqCst);
        }).unwrap();
    }
    let stop = {
        let interrupts = interrupts.clone();
        move || interrupts.load(Ordering::SeqCst) > 0
    };
    let force_stop = {
        let interrupts = interrupts.clone();
        move || interrupts.load(Ordering::SeqCst) > 1
    };

    let exposure = ExposureSettings::new(args.exposure, args.binning);
    let tolerance = SolvingTolerance::new(args.tolerance_arcsec,
                                          args.tolerance_arcsec);
    let paths = PathMaker::new(&args.data_root);

    match args.command {
        Command::Run { home_mount } => {
            start_up_or_exit(&unit, home_mount, &stop);
            info!("unit is ready; Ctrl-C to shut down");
            while !stop() {
                thread::sleep(Duration::from_millis(500));
            }
            shut_down(&unit, &force_stop);
        }

        Command::Acquire { ra, dec, stage_sky, stage_spec, no_guide,
                           cadence } => {
            start_up_or_exit(&unit, false, &stop);
            let guide = if no_guide {
                None
            } else {
                Some(GuideParams {
                    exposure: exposure.clone(),
                    cadence,
                    tolerance,
                    ..Default::default()
                })
            };
            let response = unit.acquire(AcquireParams {
                target: Coordinate::new(ra, dec),
                exposure,
                tolerance,
                stage_sky_position: stage_sky,
                stage_spec_position: stage_spec,
                output_root: Some(args.data_root.clone()),
                guide,
                ..Default::default()
            });
            if !response.succeeded {
                error!("acquire failed: {}", response.errors.join("; "));
                shut_down(&unit, &force_stop);
                std::process::exit(1);
            }
            while unit.status().acquiring && !stop() {
                thread::sleep(Duration::from_millis(500));
            }
            while unit.status().guiding && !stop() {
                thread::sleep(Duration::from_millis(500));
            }
            shut_down(&unit, &force_stop);
            if let Some(outcome) = unit.status().last_acquisition {
                info!("acquisition: succeeded={} phases=[{}]",
                      outcome.succeeded, outcome.phases_completed.join(", "));
                for e in &outcome.errors {
                    error!("acquisition: {}", e);
                }
            }
        }

        Command::Guide { cadence } => {
            start_up_or_exit(&unit, false, &stop);
            let output_folder = match paths.guiding_folder() {
                Ok(folder) => Some(folder),
                Err(e) => {
                    warn!("no session folder: {:?}", e);
                    None
                }
            };
            let response = unit.start_guiding(GuideParams {
                exposure,
                cadence,
                tolerance,
                output_folder,
                ..Default::default()
            });
            if !response.succeeded {
                error!("guide failed: {}", response.errors.join("; "));
                shut_down(&unit, &force_stop);
                std::process::exit(1);
            }
            info!("guiding; Ctrl-C to stop");
            while unit.status().guiding && !stop() {
                thread::sleep(Duration::from_millis(500));
            }
            shut_down(&unit, &force_stop);
        }

        Command::Focus { start_position, ticks_per_step, num_images } => {
            start_up_or_exit(&unit, false, &stop);
            let output_folder = paths.focusing_folder().unwrap_or_else(|e| {
                warn!("no session folder: {:?}", e);
                args.data_root.join("Focusings")
            });
            let response = unit.start_autofocus(AutofocusParams {
                exposure,
                start_position,
                ticks_per_step,
                num_images,
                output_folder,
                known_focus_path: Some(args.data_root.join("known_focus.json")),
                ..Default::default()
            });
            if !response.succeeded {
                error!("focus failed: {}", response.errors.join("; "));
                shut_down(&unit, &force_stop);
                std::process::exit(1);
            }
            while unit.status().autofocusing && !stop() {
                thread::sleep(Duration::from_millis(500));
            }
            shut_down(&unit, &force_stop);
            if let Some(outcome) = unit.status().last_autofocus {
                match outcome.best_position {
                    Some(position) => {
                        info!("autofocus: best position {} (tolerance {:.1})",
                              position, outcome.tolerance.unwrap_or(0.0));
                    }
                    None => {
                        error!("autofocus failed: {}",
                               outcome.errors.join("; "));
                    }
                }
            }
        }

        Command::Solve { ra, dec } => {
            start_up_or_exit(&unit, false, &stop);
            let current = mount.position();
            let target = Coordinate::new(ra.unwrap_or(current.ra),
                                         dec.unwrap_or(current.dec));
            let output_folder = match paths.correction_folder() {
                Ok(folder) => Some(folder),
                Err(e) => {
                    warn!("no session folder: {:?}", e);
                    None
                }
            };
            let response = unit.solve_and_correct(&CorrectionParams {
                phase: "one-shot".to_string(),
                target,
                exposure,
                tolerance,
                output_folder,
                ..Default::default()
            }, &stop);
            if response.succeeded {
                info!("solve and correct converged on {}", target);
            } else {
                error!("solve and correct failed: {}",
                       response.errors.join("; "));
            }
            shut_down(&unit, &force_stop);
            if !response.succeeded {
                std::process::exit(1);
            }
        }

        Command::Status => {
            // Give the pollers a moment to reach the devices.
            let deadline = std::time::Instant::now() + Duration::from_secs(5);
            while !unit.connected() && std::time::Instant::now() < deadline {
                thread::sleep(Duration::from_millis(50));
            }
            println!("{}",
                     serde_json::to_string_pretty(&unit.status()).unwrap());
        }
    }
}
