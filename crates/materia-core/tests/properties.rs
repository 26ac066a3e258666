//! Whole-run behaviour of the solver:
//! conservation, reproducibility, resuming, multi-rank equivalence
//! and the population events.

use std::sync::Arc;

use approx::assert_relative_eq;
use materia_core::{
    comm::LocalGroup,
    config::{NodalTractionConfig, ParticleTractionConfig},
    material::PRESSURE,
    na,
    schedule::EventState,
    Checkpoint, CheckpointStore, Communicator, MemoryCheckpointStore, Mesh, MpmError,
    ParticleRecord, SimulationConfig, Solver, Stage, SOLID,
};

fn config(analysis_type: &str, nsteps: usize, extra_analysis: &str) -> SimulationConfig {
    let json = format!(
        r#"{{
            "analysis": {{
                "type": "{analysis_type}",
                "dt": 1.0e-4,
                "nsteps": {nsteps},
                "output_steps": 1,
                "gravity": [0.0, -9.81]
                {extra_analysis}
            }},
            "materials": [
                {{"type": "LinearElastic", "id": 0, "density": 1000.0,
                 "youngs_modulus": 1.0e6, "poisson_ratio": 0.3}},
                {{"type": "Newtonian", "id": 1, "density": 1000.0,
                 "bulk_modulus": 1.0e6, "dynamic_viscosity": 1.0e-3}}
            ],
            "particle_sets": [{{"id": 1, "ids": [0, 1, 2, 3, 4, 5, 6, 7]}}],
            "particle_properties": [{{"material_id": 0}}],
            "velocity_constraints": [
                {{"set_id": 0, "dir": 0, "velocity": 0.0}},
                {{"set_id": 0, "dir": 1, "velocity": 0.0}}
            ]
        }}"#
    );
    SimulationConfig::from_json_str(&json).expect("valid config")
}

/// A block of particles standing on the fixed bottom of a unit square grid,
/// keeping the particles with `keep(id)`.
///
/// Node set 0 is the bottom row of nodes
/// and node set 2 the row level with the top of the block,
/// of which only the nodes above the block are active.
fn block_mesh(keep: impl Fn(usize) -> bool) -> Mesh<2> {
    let mut mesh =
        Mesh::hypercube_grid(na::Vector2::zeros(), na::Vector2::repeat(0.125), [8, 8])
            .expect("valid grid");
    mesh.create_node_set_from_predicate(0, |n| n.coordinates().y == 0.);
    mesh.create_node_set_from_predicate(2, |n| n.coordinates().y == 0.5);
    let material = materia_core::MaterialConfig::LinearElastic {
        id: 0,
        density: 1000.,
        youngs_modulus: 1.0e6,
        poisson_ratio: 0.3,
    }
    .build::<2>()
    .expect("valid material");
    let ids = mesh
        .seed_particles(2, 0, &material, |s| {
            (0.25..0.75).contains(&s.coordinates.x) && s.coordinates.y < 0.5
        })
        .expect("seeds are inside");
    let others: Vec<usize> = ids.into_iter().filter(|&id| !keep(id)).collect();
    mesh.remove_particles(&others);
    mesh
}

fn records(mesh: &Mesh<2>) -> Vec<ParticleRecord> {
    let mut records: Vec<ParticleRecord> = mesh.particles().iter().map(|p| p.record()).collect();
    records.sort_by_key(|r| r.id);
    records
}

#[test]
fn mass_is_conserved() {
    let mut solver =
        Solver::new(&config("MPMExplicitUSF2D", 20, ""), block_mesh(|_| true)).expect("valid setup");
    let initial = solver.mesh().total_particle_mass();
    assert_relative_eq!(initial, 1000. * 0.5 * 0.5, max_relative = 1e-12);

    while solver.state().stage != Stage::Finished {
        solver.step_once().expect("stable step");
        let mesh = solver.mesh();
        assert_relative_eq!(mesh.total_particle_mass(), initial, max_relative = 1e-12);
        assert_relative_eq!(mesh.total_nodal_mass(SOLID), initial, max_relative = 1e-12);
    }
}

#[test]
fn untouched_nodes_stay_zero() {
    let mut solver =
        Solver::new(&config("MPMExplicitUSL2D", 5, ""), block_mesh(|_| true)).expect("valid setup");
    solver.solve().expect("stable run");

    let mesh = solver.mesh();
    let active = mesh.active_nodes();
    assert!(active.count_ones(..) > 0);
    assert!(active.count_ones(..) < mesh.nodes().len());
    for node in mesh.nodes().iter().filter(|n| !active.contains(n.id())) {
        assert!(
            node.state().is_zero(),
            "node {} outside the occupied cells has nonzero state",
            node.id()
        );
        assert!(!node.status());
    }
}

#[test]
fn repeated_runs_are_identical() {
    for scheme in ["MPMExplicitUSF2D", "MPMExplicitUSL2D"] {
        let run = || {
            let mut solver = Solver::new(
                &config(scheme, 15, r#", "pressure_smoothing": true, "strain_energy": true"#),
                block_mesh(|_| true),
            )
            .expect("valid setup");
            solver.solve().expect("stable run");
            records(solver.mesh())
        };
        let first = run();
        assert!(first.iter().any(|r| r.displacement[1] < 0.), "{scheme}: block should settle");
        assert_eq!(first, run(), "{scheme}: repeated runs differ");
    }
}

#[test]
fn resume_matches_uninterrupted_run() {
    let events = r#", "change_materials": [{"step": 3, "set_id": 1, "material_id": 1}],
        "pressure_smoothing": true"#;

    let store = MemoryCheckpointStore::default();
    let mut full = Solver::new(&config("MPMExplicitUSF2D", 8, events), block_mesh(|_| true))
        .expect("valid setup")
        .with_checkpoint_store(store.clone());
    full.solve().expect("stable run");
    assert_eq!(store.steps(), (1..=8).collect::<Vec<_>>());

    // a fresh store holding only the checkpoint taken before step 5
    let checkpoint: Checkpoint = store.load(5).expect("checkpoint was saved");
    assert_eq!(checkpoint.step, 5);
    let mut resume_store = MemoryCheckpointStore::default();
    resume_store.save(checkpoint).expect("serializable");

    let resume = format!(r#"{events}, "resume": {{"resume": true, "step": 5}}"#);
    let mut resumed = Solver::new(&config("MPMExplicitUSF2D", 8, &resume), block_mesh(|_| true))
        .expect("valid setup")
        .with_checkpoint_store(resume_store);
    resumed.step_once().expect("restore and step");
    assert_eq!(resumed.state().step, 6);
    assert_eq!(
        resumed.change_material_schedule().events_at(3)[0].state,
        EventState::Applied
    );
    for id in 0..8 {
        let p = resumed.mesh().particle(id).expect("restored");
        assert_eq!(p.material_id(), Some(1));
        assert!(
            p.state_variable(PRESSURE).is_some_and(|pressure| pressure != 0.),
            "restored fluid pressure was reset"
        );
    }
    resumed.solve().expect("stable run");

    assert_eq!(records(resumed.mesh()), records(full.mesh()));
}

/// Reduced nodal state after a step, which every rank should hold identically.
#[derive(Debug)]
struct NodalSnapshot {
    total_mass: f64,
    active: Vec<usize>,
    mass: Vec<f64>,
    momentum: Vec<na::Vector2<f64>>,
    external_force: Vec<na::Vector2<f64>>,
}

impl NodalSnapshot {
    fn of(mesh: &Mesh<2>) -> Self {
        let nodes = mesh.nodes();
        let active: Vec<usize> = mesh.active_nodes().ones().collect();
        Self {
            total_mass: mesh.total_nodal_mass(SOLID),
            mass: active.iter().map(|&n| nodes[n].mass(SOLID)).collect(),
            momentum: active.iter().map(|&n| nodes[n].momentum(SOLID)).collect(),
            external_force: active.iter().map(|&n| nodes[n].external_force(SOLID)).collect(),
            active,
        }
    }

    fn assert_matches(&self, serial: &Self, context: &str) {
        assert_eq!(self.active, serial.active, "{context}: active nodes differ");
        assert_relative_eq!(self.total_mass, serial.total_mass, max_relative = 1e-12);
        for (a, b) in self.mass.iter().zip(&serial.mass) {
            assert_relative_eq!(a, b, max_relative = 1e-12);
        }
        for (a, b) in self.momentum.iter().zip(&serial.momentum) {
            assert_relative_eq!(a, b, epsilon = 1e-12, max_relative = 1e-9);
        }
        for (a, b) in self.external_force.iter().zip(&serial.external_force) {
            assert_relative_eq!(a, b, epsilon = 1e-10, max_relative = 1e-9);
        }
    }
}

/// Step a solver to the end, taking a nodal snapshot after every step.
fn run_with_snapshots(mut solver: Solver<2>) -> (Solver<2>, Vec<NodalSnapshot>) {
    let mut snapshots = Vec::new();
    while solver.state().stage != Stage::Finished {
        solver.step_once().expect("stable step");
        snapshots.push(NodalSnapshot::of(solver.mesh()));
    }
    (solver, snapshots)
}

/// Run the block on `nranks` threads with particles dealt out by id.
/// Returns the merged particle records and each rank's snapshots.
fn run_on_ranks(
    nranks: usize,
    config: &SimulationConfig,
) -> (Vec<ParticleRecord>, Vec<Vec<NodalSnapshot>>) {
    let comms = LocalGroup::new(nranks).split();
    let runs: Vec<(Vec<ParticleRecord>, Vec<NodalSnapshot>)> = std::thread::scope(|s| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                s.spawn(move || {
                    let rank = comm.rank();
                    let mesh =
                        block_mesh(|id| id % nranks == rank).with_communicator(Arc::new(comm));
                    let (solver, snapshots) =
                        run_with_snapshots(Solver::new(config, mesh).expect("valid setup"));
                    (records(solver.mesh()), snapshots)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank panicked"))
            .collect()
    });

    let mut merged = Vec::new();
    let mut snapshots = Vec::new();
    for (rank_records, rank_snapshots) in runs {
        merged.extend(rank_records);
        snapshots.push(rank_snapshots);
    }
    merged.sort_by_key(|r| r.id);
    (merged, snapshots)
}

/// Check that 1, 2 and 4 ranks reproduce a serial run
/// step by step on the nodes and at the end on the particles.
/// Returns the serial solver and its snapshots.
fn assert_ranks_agree(config: &SimulationConfig) -> (Solver<2>, Vec<NodalSnapshot>) {
    let (serial_solver, serial_nodes) =
        run_with_snapshots(Solver::new(config, block_mesh(|_| true)).expect("valid setup"));
    let serial = records(serial_solver.mesh());

    for nranks in [1, 2, 4] {
        let (merged, rank_nodes) = run_on_ranks(nranks, config);

        for (rank, steps) in rank_nodes.iter().enumerate() {
            assert_eq!(steps.len(), serial_nodes.len());
            for (step, (a, b)) in steps.iter().zip(&serial_nodes).enumerate() {
                a.assert_matches(b, &format!("{nranks} ranks, rank {rank}, step {step}"));
            }
        }

        assert_eq!(merged.len(), serial.len(), "{nranks} ranks lost particles");
        for (m, s) in merged.iter().zip(&serial) {
            assert_eq!(m.id, s.id);
            for (a, b) in m.coordinates.iter().zip(&s.coordinates) {
                assert_relative_eq!(a, b, epsilon = 1e-12, max_relative = 1e-9);
            }
            for (a, b) in m.velocity.iter().zip(&s.velocity) {
                assert_relative_eq!(a, b, epsilon = 1e-10, max_relative = 1e-8);
            }
            for (a, b) in m.stress.iter().zip(&s.stress) {
                assert_relative_eq!(a, b, epsilon = 1e-6, max_relative = 1e-8);
            }
            match (m.state_vars.get(PRESSURE), s.state_vars.get(PRESSURE)) {
                (Some(a), Some(b)) => assert_relative_eq!(a, b, epsilon = 1e-6, max_relative = 1e-8),
                (a, b) => assert_eq!(a, b, "particle {}: pressure variables differ", m.id),
            }
        }
    }
    (serial_solver, serial_nodes)
}

#[test]
fn ranks_agree_with_single_rank() {
    assert_ranks_agree(&config("MPMExplicitUSL2D", 10, ""));
}

#[test]
fn tractions_and_smoothed_pressure_agree_across_ranks() {
    let mut config = config("MPMExplicitUSF2D", 10, r#", "pressure_smoothing": true"#);
    config.particle_properties[0].material_id = 1;
    config.nodal_tractions.push(NodalTractionConfig {
        set_id: 2,
        dir: 0,
        force: 5.,
    });
    config.particle_tractions.push(ParticleTractionConfig {
        set_id: 1,
        dir: 1,
        traction: -50.,
    });

    let (solver, snapshots) = assert_ranks_agree(&config);

    // nothing else pushes sideways, so the x force on a loaded node is the
    // concentrated force counted once, whatever the number of ranks
    let loaded = solver.mesh().node_set(2).expect("node set 2").to_vec();
    for snapshot in &snapshots {
        let mut loaded_active = 0;
        for (&n, force) in snapshot.active.iter().zip(&snapshot.external_force) {
            if loaded.contains(&n) {
                loaded_active += 1;
                assert_relative_eq!(force.x, 5., max_relative = 1e-12);
            } else {
                assert_eq!(force.x, 0., "node {n} has an x force without a load");
            }
        }
        assert_eq!(loaded_active, 5, "nodes above the block should be active");
    }
    let active = solver.mesh().active_nodes();
    for &n in loaded.iter().filter(|&&n| !active.contains(n)) {
        let node = &solver.mesh().nodes()[n];
        assert!(
            node.state().is_zero(),
            "inactive loaded node {n} picked up its force"
        );
    }

    let fluid = records(solver.mesh());
    assert!(fluid
        .iter()
        .all(|r| r.state_vars.get(PRESSURE).is_some_and(|p| p.is_finite())));
    assert!(fluid[0].traction[1] < 0.);
    assert_eq!(fluid[8].traction, vec![0., 0.]);

    // without the particle traction the block moves differently
    let mut without_traction = config.clone();
    without_traction.particle_tractions.clear();
    let mut solver = Solver::new(&without_traction, block_mesh(|_| true)).expect("valid setup");
    solver.solve().expect("stable run");
    assert_ne!(records(solver.mesh()), fluid);
}

#[test]
fn lost_particles_abort_the_run() {
    for scheme in ["MPMExplicitUSF2D", "MPMExplicitUSL2D"] {
        let mut mesh = block_mesh(|_| true);
        mesh.iterate_over_particles(|p, _| p.assign_velocity(na::Vector2::new(1.0e4, 0.)));
        // free the bottom so the nodes carry the particle velocity
        let mut config = config(scheme, 5, "");
        config.velocity_constraints.clear();
        let mut solver = Solver::new(&config, mesh).expect("valid setup");

        match solver.step_once() {
            Err(MpmError::UnlocatableParticles {
                step,
                particles,
                total,
            }) => {
                assert_eq!(step, 0);
                assert_eq!(total, 64);
                assert_eq!(particles, (0..64).collect::<Vec<_>>());
            }
            other => panic!("{scheme}: expected lost particles, got {other:?}"),
        }
        assert_eq!(solver.state().stage, Stage::Aborted);
        assert!(matches!(solver.step_once(), Err(MpmError::Aborted)));
        assert!(matches!(solver.solve(), Err(MpmError::Aborted)));
    }
}

#[test]
fn particles_are_added_on_schedule() {
    let add = r#", "add_particles": {
        "start_step": 2, "interval": 3, "end_step": 10, "first_id": 100,
        "material_id": 0, "volume": 0.01, "coordinates": [0.5, 0.8]
    }"#;

    let mut solver =
        Solver::new(&config("MPMExplicitUSF2D", 12, add), block_mesh(|_| true)).expect("valid setup");
    solver.solve().expect("stable run");
    let mut added: Vec<usize> = solver
        .mesh()
        .particles()
        .iter()
        .map(|p| p.id())
        .filter(|&id| id >= 100)
        .collect();
    added.sort_unstable();
    // floor((10 - 2) / 3) + 1 particles
    assert_eq!(added, vec![100, 101, 102]);

    // with two ranks only rank 0 attaches them
    let comms = LocalGroup::new(2).split();
    let counts: Vec<usize> = std::thread::scope(|s| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                s.spawn(move || {
                    let rank = comm.rank();
                    let mesh = block_mesh(|id| id % 2 == rank).with_communicator(Arc::new(comm));
                    let mut solver = Solver::new(&config("MPMExplicitUSF2D", 12, add), mesh)
                        .expect("valid setup");
                    solver.solve().expect("stable run");
                    solver.mesh().particles().iter().filter(|p| p.id() >= 100).count()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank panicked"))
            .collect()
    });
    assert_eq!(counts, vec![3, 0]);
}
