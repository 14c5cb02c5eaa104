use std::time::Instant;

use clap::Parser;
use lm_universal::core::Estimator;
use lm_universal::init_logger_with_level;
use lm_universal::linalg::LinearSolverType;
use lm_universal::optimizer::LevenbergMarquardtConfig;
use lm_universal::problems::plane::{Plane, optimize_plane};
use lm_universal::problems::pose_plane::{PinholeCamera, PosesPlaneData, optimize_poses_plane};
use nalgebra::{Isometry3, Point3, Vector2, Vector3};
use tracing::{Level, info, warn};

#[derive(Parser)]
#[command(name = "optimize_plane")]
#[command(about = "Fit a plane to 3D points, or a plane and camera poses to image points")]
struct Args {
    /// Problem: "points" (plane from 3D points) or "poses" (plane and camera poses)
    #[arg(short, long, default_value = "points")]
    problem: String,

    /// Number of 3D points
    #[arg(short = 'n', long, default_value = "200")]
    points: usize,

    /// Number of second cameras for the "poses" problem
    #[arg(short, long, default_value = "4")]
    cameras: usize,

    /// Amplitude of the deterministic noise
    #[arg(long, default_value = "0.01")]
    noise: f64,

    /// Robust estimator: "square", "linear", "huber", "tukey" or "cauchy"
    #[arg(short, long, default_value = "square")]
    estimator: Estimator,

    /// Linear solver for the "poses" problem: "cholesky" or "schur"
    #[arg(long, default_value = "schur")]
    solver: String,

    /// Maximum number of optimization iterations
    #[arg(short, long, default_value = "30")]
    max_iterations: usize,

    /// Snap image residuals onto a 0.2 pixel grid
    #[arg(long)]
    quantized: bool,

    /// Print the per-iteration table
    #[arg(short, long)]
    verbose: bool,
}

/// Deterministic jitter in `[-1, 1]`.
fn jitter(i: usize, salt: f64) -> f64 {
    (i as f64 * 12.9898 + salt * 78.233).sin()
}

fn grid(count: usize) -> impl Iterator<Item = Vector3<f64>> {
    let side = (count as f64).sqrt().ceil().max(2.0) as usize;
    (0..count).map(move |i| {
        Vector3::new(
            (i % side) as f64 / side as f64 * 4.0 - 2.0,
            (i / side) as f64 / side as f64 * 3.0 - 1.5,
            0.0,
        )
    })
}

fn fit_points(
    args: &Args,
    config: &LevenbergMarquardtConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let truth = Plane::from_angles(0.3, -0.2, 4.0);
    let points: Vec<Vector3<f64>> = grid(args.points)
        .enumerate()
        .map(|(i, p)| truth.project(&p) + truth.normal() * jitter(i, 3.0) * args.noise)
        .collect();
    let initial = Plane::from_angles(0.1, 0.0, 3.0);

    let start = Instant::now();
    let result = optimize_plane(&initial, &points, config)?;
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

    let (yaw, pitch) = result.parameters.decompose_normal();
    info!("{}", result.summary);
    info!("Status:            {}", result.status);
    info!("Initial error:     {:.6e}", result.initial_error);
    info!("Final error:       {:.6e}", result.final_error);
    info!("Plane yaw/pitch:   {:.6} / {:.6} (truth 0.3 / -0.2)", yaw, pitch);
    info!("Plane distance:    {:.6} (truth 4.0)", result.parameters.distance());
    info!("Time:              {:.2}ms", elapsed_ms);
    Ok(())
}

fn fit_poses(
    args: &Args,
    config: &LevenbergMarquardtConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let camera = PinholeCamera::new(500.0, 500.0, 320.0, 240.0);
    let truth = Plane::from_angles(0.15, -0.1, 6.0);
    let world_points: Vec<Vector3<f64>> = grid(args.points).map(|p| truth.project(&p)).collect();

    let observe = |pose: &Isometry3<f64>, salt: f64| -> Vec<Vector2<f64>> {
        world_points
            .iter()
            .enumerate()
            .filter_map(|(i, p)| {
                let noise = Vector2::new(jitter(i, salt), jitter(i, salt + 0.5)) * args.noise;
                camera
                    .project(&(pose * Point3::from(*p)).coords)
                    .map(|q| q + noise)
            })
            .collect()
    };

    let first = Isometry3::identity();
    let poses: Vec<Isometry3<f64>> = (0..args.cameras)
        .map(|c| {
            let c = (c + 1) as f64;
            Isometry3::new(
                Vector3::new(-0.4 * c, 0.03 * c, 0.05),
                Vector3::new(0.0, -0.03 * c, 0.01),
            )
        })
        .collect();

    let groups: Vec<Vec<Vector2<f64>>> = poses
        .iter()
        .enumerate()
        .map(|(c, pose)| observe(pose, c as f64 + 1.0))
        .collect();
    let mut data = PosesPlaneData::new(
        camera,
        &first,
        &observe(&first, 0.0),
        truth.distance(),
        groups,
    )?
    .with_quantized_residuals(args.quantized);
    info!(
        "Cameras: {}, points per camera: {}",
        data.number_cameras(),
        data.number_points()
    );

    let offset = Isometry3::new(Vector3::new(0.05, -0.03, 0.02), Vector3::new(0.01, 0.02, 0.0));
    let initial: Vec<Isometry3<f64>> = poses.iter().map(|pose| offset * pose).collect();
    let initial_plane = Plane::from_angles(0.05, 0.0, truth.distance());

    let start = Instant::now();
    let result = optimize_poses_plane(&mut data, &initial, &initial_plane, config)?;
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

    let (optimized, plane) = &result.parameters;
    let worst_translation = optimized
        .iter()
        .zip(&poses)
        .map(|(pose, truth)| (pose.translation.vector - truth.translation.vector).norm())
        .fold(0.0, f64::max);

    info!("{}", result.summary);
    info!("Status:            {}", result.status);
    info!("Initial error:     {:.6e}", result.initial_error);
    info!("Final error:       {:.6e}", result.final_error);
    info!("Normal deviation:  {:.6e}", (plane.normal() - truth.normal()).norm());
    info!("Worst translation: {:.6e}", worst_translation);
    info!("Time:              {:.2}ms", elapsed_ms);
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    init_logger_with_level(if args.verbose { Level::DEBUG } else { Level::INFO });

    info!("LM-UNIVERSAL PLANE OPTIMIZATION\n");

    let linear_solver_type = match args.solver.to_lowercase().as_str() {
        "cholesky" => LinearSolverType::SparseCholesky,
        "schur" => LinearSolverType::Schur,
        other => {
            warn!("Unknown solver '{}', using the Schur complement", other);
            LinearSolverType::Schur
        }
    };
    let config = LevenbergMarquardtConfig::new()
        .with_max_iterations(args.max_iterations)
        .with_estimator(args.estimator)
        .with_linear_solver_type(linear_solver_type);

    match args.problem.to_lowercase().as_str() {
        "points" => fit_points(&args, &config),
        "poses" => fit_poses(&args, &config),
        other => Err(format!("unknown problem '{}', expected 'points' or 'poses'", other).into()),
    }
}
