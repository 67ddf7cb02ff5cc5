use std::{
    collections::{BTreeMap, BTreeSet},
    f64::consts::PI,
};

use anyhow::Result;
use approx::assert_abs_diff_eq;
use ndarray::{arr1, arr2, ArrayD};
use plated_is::{
    AxisArray, BoundPlate, Dim, Error, Group, IndependentUniform, NamedTensor, Normal, Param,
    Permutation, PermutationSettings, Plate, Problem, Scope, Tree, UniformSettings,
};
use pretty_assertions::assert_eq;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

fn column(values: &[f64]) -> ArrayD<f64> {
    arr1(values).into_dyn()
}

fn no_data() -> Vec<(String, AxisArray)> {
    Vec::new()
}

fn log_normal(x: f64, loc: f64, scale: f64) -> f64 {
    let z = (x - loc) / scale;
    -0.5 * z * z - scale.ln() - 0.5 * (2. * PI).ln()
}

/// `log N(x; 0, a I + b J)` for an `n`-vector `x`.
fn log_exchangeable_normal(x: &[f64], a: f64, b: f64) -> f64 {
    let n = x.len() as f64;
    let sum = x.iter().sum::<f64>();
    let sum_sq = x.iter().map(|v| v * v).sum::<f64>();
    let log_det = (n - 1.) * a.ln() + (a + n * b).ln();
    let quad = (sum_sq - b * sum * sum / (a + n * b)) / a;
    -0.5 * n * (2. * PI).ln() - 0.5 * log_det - 0.5 * quad
}

/// `log N(x; 0, cov)` through a Cholesky factor of `cov`.
fn log_mvn(x: &[f64], cov: impl Fn(usize, usize) -> f64) -> f64 {
    let n = x.len();
    let mut chol = vec![vec![0f64; n]; n];
    for i in 0..n {
        for j in 0..=i {
            let rest = (0..j).map(|k| chol[i][k] * chol[j][k]).sum::<f64>();
            chol[i][j] = if i == j {
                (cov(i, i) - rest).sqrt()
            } else {
                (cov(i, j) - rest) / chol[j][j]
            };
        }
    }
    let mut z = vec![0f64; n];
    for i in 0..n {
        let rest = (0..i).map(|k| chol[i][k] * z[k]).sum::<f64>();
        z[i] = (x[i] - rest) / chol[i][i];
    }
    let log_det = 2. * (0..n).map(|i| chol[i][i].ln()).sum::<f64>();
    -0.5 * n as f64 * (2. * PI).ln() - 0.5 * log_det - 0.5 * z.iter().map(|v| v * v).sum::<f64>()
}

/// `a` at the top, `b` per element of `p1`, `c` and observed `x` per element
/// of `p2` inside `p1`.
fn two_level(x: &[[f64; 3]; 2]) -> Result<Problem> {
    let p = Plate::new().var("a", Normal::new(0., 1.)).plate(
        "p1",
        Plate::new().var("b", Normal::new("a", 1.)).plate(
            "p2",
            Plate::new()
                .var("c", Normal::new("b", 1.))
                .var("x", Normal::new("c", 1.)),
        ),
    );
    let q = Plate::new().var("a", Normal::new(0., 1.)).plate(
        "p1",
        Plate::new()
            .var("b", Normal::new("a", 1.))
            .plate("p2", Plate::new().var("c", Normal::new("b", 1.))),
    );
    Ok(Problem::new(
        p,
        q,
        [("p1", 2), ("p2", 3)],
        [("x", AxisArray::new(["p1", "p2"], arr2(x).into_dyn()))],
    )?)
}

/// Global `z`, per-observation latent `y`, observed `x`.
fn hierarchical(x: &[f64]) -> Result<Problem> {
    let p = Plate::new().var("z", Normal::new(0., 1.)).plate(
        "obs",
        Plate::new()
            .var("y", Normal::new("z", 1.))
            .var("x", Normal::new("y", 1.)),
    );
    let q = Plate::new()
        .var("z", Normal::new(0., 1.))
        .plate("obs", Plate::new().var("y", Normal::new("z", 1.)));
    Ok(Problem::new(
        p,
        q,
        [("obs", x.len())],
        [("x", AxisArray::new(["obs"], column(x)))],
    )?)
}

#[test]
fn sample_dims_follow_plates_and_groups() -> Result<()> {
    let p = Plate::new().plate("plate_1", Plate::new().var("z", Normal::new(0., 1.)));
    let q = Plate::new().plate("plate_1", Plate::new().var("z", Normal::new(0., 1.)));
    let problem = Problem::new(p, q, [("plate_1", 3)], no_data())?;

    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let sample = problem.sample(&mut rng, 4, false, IndependentUniform)?;
    let z = sample
        .tree()
        .plate("plate_1")
        .and_then(|tree| tree.value("z"))
        .expect("z is sampled");
    assert_eq!(z.dims(), &[Dim::plate("plate_1", 3), Dim::k("z", 4)]);
    Ok(())
}

#[test]
fn missing_proposal_is_a_name_mismatch() {
    let p = Plate::new()
        .var("a", Normal::new(0., 1.))
        .var("b", Normal::new("a", 1.));
    let q = Plate::new().var("a", Normal::new(0., 1.));
    let err = Problem::new(p, q, Vec::<(String, usize)>::new(), no_data()).unwrap_err();
    match err {
        Error::NameMismatch { names } => assert_eq!(names, vec!["b".to_string()]),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn samples_have_the_same_structure() -> Result<()> {
    let problem = hierarchical(&[0.3, -0.2])?;
    let mut rng = ChaCha8Rng::seed_from_u64(1);

    let shapes = |tree: &Tree<NamedTensor>| {
        tree.flatten()
            .into_iter()
            .map(|(path, name, value)| (path, name.to_string(), value.dims().to_vec()))
            .collect::<Vec<_>>()
    };
    let first = problem.sample(&mut rng, 5, true, IndependentUniform)?;
    let second = problem.sample(&mut rng, 5, true, IndependentUniform)?;
    assert_eq!(shapes(first.tree()), shapes(second.tree()));

    let names = first
        .tree()
        .flatten()
        .into_iter()
        .map(|(_, name, _)| name.to_string())
        .collect::<BTreeSet<_>>();
    let expected = problem.q().plate().all_prog_names().into_iter().collect::<BTreeSet<_>>();
    assert_eq!(names, expected);
    Ok(())
}

#[test]
fn dependency_map_is_acyclic() -> Result<()> {
    let p = Plate::new()
        .var("a", Normal::new(0., 1.))
        .group(
            "g",
            Group::new()
                .var("b", Normal::new("a", 1.))
                .var("c", Normal::new("a", 2.)),
        )
        .plate(
            "p",
            Plate::new()
                .var("d", Normal::new("c", 1.))
                .var("x", Normal::new("d", 1.)),
        );
    let q = Plate::new()
        .var("a", Normal::new(0., 1.))
        .group(
            "g",
            Group::new()
                .var("b", Normal::new(0., 1.))
                .var("c", Normal::new(0., 1.)),
        )
        .plate("p", Plate::new().var("d", Normal::new(0., 1.)));
    let problem = Problem::new(
        p,
        q,
        [("p", 2)],
        [("x", AxisArray::new(["p"], column(&[1., 2.])))],
    )?;

    let deps = problem.groupvarname2parent_groupvarnames();
    let expected: BTreeMap<String, Vec<String>> = [
        ("a".to_string(), vec![]),
        ("d".to_string(), vec!["g".to_string()]),
        ("g".to_string(), vec!["a".to_string()]),
    ]
    .into_iter()
    .collect();
    assert_eq!(deps, expected);

    // Repeatedly remove groups without remaining parents.
    let mut remaining = deps.clone();
    while !remaining.is_empty() {
        let ready = remaining
            .iter()
            .filter(|(_, parents)| parents.iter().all(|p| !remaining.contains_key(p)))
            .map(|(name, _)| name.clone())
            .collect::<Vec<_>>();
        assert!(!ready.is_empty(), "cycle in {remaining:?}");
        for name in ready {
            remaining.remove(&name);
        }
    }
    Ok(())
}

#[test]
fn prior_proposal_without_data_gives_zero() -> Result<()> {
    let model = || {
        Plate::new()
            .var("a", Normal::new(0., 1.))
            .var("b", Normal::new("a", 0.5))
            .plate("p", Plate::new().var("c", Normal::new(1., 2.)))
    };
    let problem = Problem::new(model(), model(), [("p", 4)], no_data())?;
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    let sample = problem.sample(&mut rng, 7, true, IndependentUniform)?;
    assert_abs_diff_eq!(sample.log_marginal()?, 0., epsilon = 1e-10);
    Ok(())
}

#[test]
fn exact_posterior_proposal_is_exact() -> Result<()> {
    // z ~ N(0, 1), x ~ N(z, 1), x = 0.5: the posterior is N(0.25, 0.5).
    let p = Plate::new()
        .var("z", Normal::new(0., 1.))
        .var("x", Normal::new("z", 1.));
    let q = BoundPlate::new(
        Plate::new().var("z", Normal::new("q_loc", "q_scale")),
        no_data(),
        [
            ("q_loc", AxisArray::scalar(0.25)),
            ("q_scale", AxisArray::scalar(0.5f64.sqrt())),
        ],
    )?;
    let problem = Problem::new(
        p,
        q,
        Vec::<(String, usize)>::new(),
        [("x", AxisArray::scalar(0.5))],
    )?;

    let mut rng = ChaCha8Rng::seed_from_u64(4);
    let sample = problem.sample(&mut rng, 3, false, Permutation)?;
    assert_abs_diff_eq!(
        sample.log_marginal()?,
        log_normal(0.5, 0., 2f64.sqrt()),
        epsilon = 1e-10
    );
    Ok(())
}

#[test]
fn conjugate_normal_estimate() -> Result<()> {
    let p = Plate::new()
        .var("z", Normal::new(0., 1.))
        .var("x", Normal::new("z", 1.));
    let q = Plate::new().var("z", Normal::new(0., 1.));
    let problem = Problem::new(
        p,
        q,
        Vec::<(String, usize)>::new(),
        [("x", AxisArray::scalar(0.5))],
    )?;

    let settings = UniformSettings {
        num_particles: 100,
        num_repeats: 200,
        reparam: true,
        seed: 42,
        ..Default::default()
    };
    let estimate = problem.estimate(&settings)?;
    assert_abs_diff_eq!(
        estimate.log_mean_exp(),
        log_normal(0.5, 0., 2f64.sqrt()),
        epsilon = 0.02
    );
    Ok(())
}

#[test]
fn plate_of_observations_estimate() -> Result<()> {
    let x = [0.1, -0.4, 1.2];
    let p = Plate::new()
        .var("z", Normal::new(0., 1.))
        .plate("obs", Plate::new().var("x", Normal::new("z", 1.)));
    let q = Plate::new().var("z", Normal::new(0., 1.));
    let problem = Problem::new(
        p,
        q,
        [("obs", x.len())],
        [("x", AxisArray::new(["obs"], column(&x)))],
    )?;

    let settings = UniformSettings {
        num_particles: 200,
        num_repeats: 100,
        seed: 7,
        ..Default::default()
    };
    let estimate = problem.estimate(&settings)?;
    assert_abs_diff_eq!(
        estimate.log_mean_exp(),
        log_exchangeable_normal(&x, 1., 1.),
        epsilon = 0.03
    );
    Ok(())
}

#[test]
fn hierarchical_estimate() -> Result<()> {
    let x = [0.2, -0.1, 0.5];
    let problem = hierarchical(&x)?;
    // x = z + y_noise + x_noise
    let truth = log_exchangeable_normal(&x, 2., 1.);

    let uniform = problem.estimate(&UniformSettings {
        num_particles: 200,
        num_repeats: 100,
        reparam: true,
        seed: 11,
        ..Default::default()
    })?;
    assert_abs_diff_eq!(uniform.log_mean_exp(), truth, epsilon = 0.06);

    let permutation = problem.estimate(&PermutationSettings {
        num_particles: 200,
        num_repeats: 100,
        seed: 12,
        ..Default::default()
    })?;
    assert_abs_diff_eq!(permutation.log_mean_exp(), truth, epsilon = 0.1);
    Ok(())
}

#[test]
fn outer_particles_reach_the_inner_plate() -> Result<()> {
    let problem = hierarchical(&[0.4, 0.0])?;
    let mut rng = ChaCha8Rng::seed_from_u64(9);
    let sample = problem.sample(&mut rng, 6, false, IndependentUniform)?;

    let log_p = sample.log_p()?;
    let y = log_p
        .plate("obs")
        .and_then(|tree| tree.value("y"))
        .expect("log P of y");
    let (kz, ky) = (Dim::k("z", 6), Dim::k("y", 6));
    assert!(y.has_dim(&kz) && y.has_dim(&ky));

    let weights = sample.importance_weights("z")?;
    assert_eq!(weights.dims(), &[kz]);
    assert_abs_diff_eq!(weights.iter().sum::<f64>(), 1., epsilon = 1e-12);
    Ok(())
}

#[test]
fn two_level_plates_estimate() -> Result<()> {
    let x = [[0.3, -0.2, 0.5], [1.0, 0.6, 0.8]];
    let problem = two_level(&x)?;

    let mut rng = ChaCha8Rng::seed_from_u64(13);
    let sample = problem.sample(&mut rng, 4, false, IndependentUniform)?;
    let c = sample
        .tree()
        .plate("p1")
        .and_then(|tree| tree.plate("p2"))
        .and_then(|tree| tree.value("c"))
        .expect("c is sampled");
    assert_eq!(
        c.dims(),
        &[Dim::plate("p1", 2), Dim::plate("p2", 3), Dim::k("c", 4)]
    );

    // x_ij = a + b_i + c_ij + noise
    let flat = x.iter().flatten().copied().collect::<Vec<_>>();
    let truth = log_mvn(&flat, |i, j| match (i == j, i / 3 == j / 3) {
        (true, _) => 4.,
        (false, true) => 2.,
        (false, false) => 1.,
    });

    let uniform = problem.estimate(&UniformSettings {
        num_particles: 100,
        num_repeats: 100,
        reparam: true,
        seed: 21,
        ..Default::default()
    })?;
    assert_abs_diff_eq!(uniform.log_mean_exp(), truth, epsilon = 0.06);

    let permutation = problem.estimate(&PermutationSettings {
        num_particles: 100,
        num_repeats: 100,
        seed: 22,
        ..Default::default()
    })?;
    assert_abs_diff_eq!(permutation.log_mean_exp(), truth, epsilon = 0.1);
    Ok(())
}

#[test]
fn group_feeding_a_plate_estimate() -> Result<()> {
    let x = [0.4, -0.3, 1.1];
    let p = Plate::new()
        .group(
            "g",
            Group::new()
                .var("a", Normal::new(0., 1.))
                .var("b", Normal::new(0., 1.)),
        )
        .plate(
            "p",
            Plate::new()
                .var("c", Normal::new(Param::expr(&["a", "b"], |v| v[0] + v[1]), 1.))
                .var("x", Normal::new("c", 1.)),
        );
    // The proposal for c only reads a.
    let q = Plate::new()
        .group(
            "g",
            Group::new()
                .var("a", Normal::new(0., 1.))
                .var("b", Normal::new(0., 1.)),
        )
        .plate("p", Plate::new().var("c", Normal::new("a", 1.5)));
    let problem = Problem::new(
        p,
        q,
        [("p", x.len())],
        [("x", AxisArray::new(["p"], column(&x)))],
    )?;

    let expected: BTreeMap<String, Vec<String>> = [
        ("c".to_string(), vec!["g".to_string()]),
        ("g".to_string(), vec![]),
    ]
    .into_iter()
    .collect();
    assert_eq!(problem.groupvarname2parent_groupvarnames(), expected);

    let mut rng = ChaCha8Rng::seed_from_u64(17);
    let sample = problem.sample(&mut rng, 5, false, Permutation)?;
    for member in ["a", "b"] {
        let value = sample.tree().value(member).expect("group member is sampled");
        assert_eq!(value.dims(), &[Dim::k("g", 5)]);
    }

    // x_i = a + b + c_noise_i + x_noise_i
    let truth = log_exchangeable_normal(&x, 2., 2.);
    let uniform = problem.estimate(&UniformSettings {
        num_particles: 200,
        num_repeats: 100,
        reparam: true,
        seed: 31,
        ..Default::default()
    })?;
    assert_abs_diff_eq!(uniform.log_mean_exp(), truth, epsilon = 0.06);

    let permutation = problem.estimate(&PermutationSettings {
        num_particles: 200,
        num_repeats: 100,
        seed: 32,
        ..Default::default()
    })?;
    assert_abs_diff_eq!(permutation.log_mean_exp(), truth, epsilon = 0.1);
    Ok(())
}

#[test]
fn log_prob_rejects_a_wrong_tree_two_plates_down() -> Result<()> {
    let problem = two_level(&[[0.; 3]; 2])?;
    let mut rng = ChaCha8Rng::seed_from_u64(19);
    let sample = problem.sample(&mut rng, 3, false, IndependentUniform)?;

    // Replace the p1/p2 subtree of the sample, keeping everything above it.
    let with_inner = |inner: Tree<NamedTensor>| {
        let mut outer = sample.tree().plate("p1").expect("p1 is sampled").clone();
        outer.insert_plate("p2", inner);
        let mut tree = sample.tree().clone();
        tree.insert_plate("p1", outer);
        tree
    };
    let log_prob = |tree: &Tree<NamedTensor>| {
        problem.q().log_prob(
            tree,
            &Scope::new(),
            &[],
            problem.all_platedims(),
            sample.groupvarname2kdim(),
        )
    };
    let inner = sample
        .tree()
        .plate("p1")
        .and_then(|tree| tree.plate("p2"))
        .expect("p2 is sampled")
        .clone();
    assert!(log_prob(&with_inner(inner.clone())).is_ok());

    let mut stray = inner.clone();
    stray.insert_value("stray", NamedTensor::scalar(0.));
    match log_prob(&with_inner(stray)) {
        Err(Error::StructureMismatch { path, reason }) => {
            assert_eq!(path, "p1/p2");
            assert!(reason.contains("`stray`"));
        }
        other => panic!("unexpected result: {other:?}"),
    }

    let mut no_kdim = inner;
    no_kdim.insert_value("c", NamedTensor::scalar(0.));
    match log_prob(&with_inner(no_kdim)) {
        Err(Error::StructureMismatch { path, reason }) => {
            assert_eq!(path, "p1/p2");
            assert!(reason.contains("K_c(3)"));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    Ok(())
}
