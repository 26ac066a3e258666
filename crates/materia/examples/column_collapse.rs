//! An elastic column settling under its own weight.
//!
//! A column of particles stands on the bottom of a rectangular grid
//! whose bottom nodes are held in place.
//! The column compresses under gravity and oscillates about its equilibrium.
//! Run with `RUST_LOG=info` to see the energy at each output step.

use materia as mt;

const CONFIG: &str = r#"{
    "analysis": {
        "type": "MPMExplicitUSF2D",
        "dt": 1.0e-4,
        "nsteps": 2000,
        "output_steps": 200,
        "gravity": [0.0, -9.81],
        "strain_energy": true
    },
    "materials": [
        {"type": "LinearElastic", "id": 0, "density": 1800.0,
         "youngs_modulus": 5.0e6, "poisson_ratio": 0.25}
    ],
    "particle_properties": [{"material_id": 0}],
    "velocity_constraints": [
        {"set_id": 0, "dir": 0, "velocity": 0.0},
        {"set_id": 0, "dir": 1, "velocity": 0.0}
    ]
}"#;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = mt::SimulationConfig::from_json_str(CONFIG)?;

    let mut mesh = mt::Mesh::hypercube_grid(mt::Vec2::zeros(), mt::Vec2::repeat(0.1), [10, 20])?;
    mesh.create_node_set_from_predicate(0, |n| n.coordinates().y == 0.);

    let material = config.materials[0].build::<2>()?;
    // a 0.4 wide, 1.2 tall column in the middle of the grid
    let ids = mesh.seed_particles(2, 0, &material, |s| {
        (0.3..0.7).contains(&s.coordinates.x) && s.coordinates.y < 1.2
    })?;
    log::info!("seeded {} particles", ids.len());

    let mut solver = mt::Solver::new(&config, mesh)?.with_output(mt::LogWriter);
    solver.solve()?;

    let top = solver
        .mesh()
        .particles()
        .iter()
        .map(|p| p.coordinates().y)
        .fold(f64::NEG_INFINITY, f64::max);
    log::info!("top of the column is at {top:.4}");
    Ok(())
}
