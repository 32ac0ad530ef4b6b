use approx::assert_relative_eq;
use mergersim::costs::{implied_margins, recover_costs};
use mergersim::demand::{CesDemand, LogitDemand};
use mergersim::{
    simulate_batch, DemandSpec, MarketObservation, MarketState, MergerError, MergerProblem,
    Ownership, SimulationOptions, ValidityWarning,
};
use nalgebra::{DMatrix, DVector};

fn scenario_a() -> MarketObservation {
    MarketObservation::builder(
        DVector::from_vec(vec![2.9, 3.4, 2.2]),
        DVector::from_vec(vec![650.0, 998.0, 1801.0]),
    )
    .observed_margins(&[0.435, 0.417, 0.370])
    .build()
    .unwrap()
}

fn pre_merger() -> Ownership {
    Ownership::firms(["1", "2", "3"])
}

fn merger_of_one_and_two() -> Ownership {
    Ownership::firms(["1", "1", "3"])
}

/// Linear demand, firms 1 and 2 merge: merging products rise, the outsider weakly.
#[test]
fn linear_merger_raises_merging_prices() {
    let problem = MergerProblem::new(
        scenario_a(),
        DemandSpec::linear(),
        pre_merger(),
        merger_of_one_and_two(),
    )
    .unwrap();
    let result = problem.simulate(&SimulationOptions::default()).unwrap();

    let pre = result.prices(MarketState::PreMerger);
    let post = result.prices(MarketState::PostMerger);
    assert_relative_eq!(pre.clone(), scenario_a().prices().clone(), epsilon = 1e-8);
    assert!(post[0] > pre[0]);
    assert!(post[1] > pre[1]);
    assert!(post[2] >= pre[2] - 1e-10);
    assert!(result.warnings().is_empty());

    let costs = result.costs(MarketState::PreMerger);
    for i in 0..3 {
        let margin = 1.0 - costs[i] / pre[i];
        assert_relative_eq!(
            margin,
            scenario_a().margins()[i].unwrap(),
            epsilon = 1e-6
        );
    }
}

/// Log-linear demand with a supplied diversion matrix whose diagonal is exactly -1.
#[test]
fn loglinear_accepts_exact_unit_diagonal() {
    let diversions = DMatrix::from_row_slice(
        3,
        3,
        &[-1.0, 0.4, 0.5, 0.3, -1.0, 0.6, 0.25, 0.45, -1.0],
    );
    let problem = MergerProblem::builder(
        scenario_a(),
        DemandSpec::LogLinear,
        pre_merger(),
        merger_of_one_and_two(),
    )
    .diversions(diversions)
    .build()
    .unwrap();
    let result = problem.simulate(&SimulationOptions::default()).unwrap();

    let diagonal = result.diversion().get(0, 0);
    assert!(diagonal > -1.0 && diagonal < -1.0 + 1e-6);
    let pre = result.prices(MarketState::PreMerger);
    let post = result.prices(MarketState::PostMerger);
    assert!(post[0] > pre[0]);
    assert!(post[1] > pre[1]);
}

#[test]
fn ownership_share_above_one_is_rejected() {
    let matrix = DMatrix::from_row_slice(3, 3, &[1.0, 1.5, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]);
    let result = MergerProblem::new(
        scenario_a(),
        DemandSpec::linear(),
        pre_merger(),
        Ownership::Matrix(matrix),
    );
    assert!(matches!(result, Err(MergerError::InvalidOwnership { .. })));
}

#[test]
fn excluded_product_has_no_post_merger_price() {
    let options = SimulationOptions::default();
    let full = MergerProblem::new(
        scenario_a(),
        DemandSpec::linear(),
        pre_merger(),
        merger_of_one_and_two(),
    )
    .unwrap()
    .simulate(&options)
    .unwrap();
    let partial = MergerProblem::builder(
        scenario_a(),
        DemandSpec::linear(),
        pre_merger(),
        merger_of_one_and_two(),
    )
    .subset(vec![true, true, false])
    .build()
    .unwrap()
    .simulate(&options)
    .unwrap();

    assert!(partial.prices(MarketState::PostMerger)[2].is_nan());
    assert!(partial.prices(MarketState::PostMerger)[0].is_finite());
    assert_eq!(
        partial.prices(MarketState::PreMerger),
        full.prices(MarketState::PreMerger)
    );
    assert_eq!(partial.subset(), [true, true, false]);
}

#[test]
fn no_merger_leaves_prices_unchanged_for_every_variant() {
    let options = SimulationOptions::default();
    for spec in [
        DemandSpec::linear(),
        DemandSpec::Linear { symmetry: true },
        DemandSpec::LogLinear,
        DemandSpec::Logit,
        DemandSpec::Ces,
        DemandSpec::Aids {
            market_elasticity: Some(-1.0),
        },
    ] {
        let name = spec.name();
        let result = MergerProblem::new(scenario_a(), spec, pre_merger(), pre_merger())
            .unwrap()
            .simulate(&options)
            .unwrap();
        let pre = result.prices(MarketState::PreMerger);
        let post = result.prices(MarketState::PostMerger);
        assert_relative_eq!(pre.clone(), post.clone(), epsilon = 1e-8);
        for change in result.price_changes().iter() {
            assert!(change.abs() < 1e-6, "{name} moved prices without a merger");
        }
    }
}

#[test]
fn simulation_is_deterministic() {
    let options = SimulationOptions::default();
    let run = || {
        MergerProblem::new(
            scenario_a(),
            DemandSpec::Logit,
            pre_merger(),
            merger_of_one_and_two(),
        )
        .unwrap()
        .simulate(&options)
        .unwrap()
    };
    let first = run();
    let second = run();
    assert_eq!(
        first.prices(MarketState::PostMerger),
        second.prices(MarketState::PostMerger)
    );
    assert_eq!(first.calibration(), second.calibration());
}

#[test]
fn batch_matches_sequential_runs() {
    let options = SimulationOptions::default();
    let specs = [DemandSpec::linear(), DemandSpec::LogLinear, DemandSpec::Ces];
    let problems: Vec<MergerProblem> = specs
        .into_iter()
        .map(|spec| {
            MergerProblem::new(scenario_a(), spec, pre_merger(), merger_of_one_and_two()).unwrap()
        })
        .collect();
    let batch = simulate_batch(&problems, &options);
    assert_eq!(batch.len(), 3);
    for (problem, outcome) in problems.iter().zip(batch) {
        let parallel = outcome.unwrap();
        let sequential = problem.simulate(&options).unwrap();
        assert_eq!(
            parallel.prices(MarketState::PostMerger),
            sequential.prices(MarketState::PostMerger)
        );
    }
}

#[test]
fn logit_pipeline_recovers_generated_market() {
    let truth = LogitDemand::new(
        -0.7,
        DVector::from_vec(vec![1.2, 0.8, 0.5]),
        5_000.0,
        true,
    )
    .unwrap();
    let prices = DVector::from_vec(vec![3.0, 2.5, 2.0]);
    let owner = pre_merger().resolve(3).unwrap();
    let quantities = mergersim::DemandSystem::quantities(&truth, &prices).unwrap();
    let margins = implied_margins(&truth, &prices, &owner).unwrap();
    let observation = MarketObservation::builder(prices.clone(), quantities)
        .observed_margins(margins.as_slice())
        .market_size(5_000.0)
        .build()
        .unwrap();

    let result = MergerProblem::new(
        observation,
        DemandSpec::Logit,
        pre_merger(),
        merger_of_one_and_two(),
    )
    .unwrap()
    .simulate(&SimulationOptions::default())
    .unwrap();
    assert_relative_eq!(result.calibration().parameters[0], -0.7, epsilon = 1e-4);

    let true_costs = recover_costs(&truth, &prices, &owner, None).unwrap();
    assert_relative_eq!(
        result.costs(MarketState::PreMerger).clone(),
        true_costs,
        epsilon = 1e-4
    );
    let changes = result.price_changes();
    assert!(changes[0] > 0.0 && changes[1] > 0.0);
    assert!(changes[2] >= 0.0);
}

#[test]
fn ces_efficiencies_offset_part_of_the_merger_price_rise() {
    let truth = CesDemand::new(4.0, DVector::from_vec(vec![0.3, 0.2, 0.1]), 10_000.0, false)
        .unwrap();
    let prices = DVector::from_vec(vec![2.0, 2.0, 2.5]);
    let owner = pre_merger().resolve(3).unwrap();
    let quantities = mergersim::DemandSystem::quantities(&truth, &prices).unwrap();
    let margins = implied_margins(&truth, &prices, &owner).unwrap();
    let observation = MarketObservation::builder(prices, quantities)
        .observed_margins(margins.as_slice())
        .build()
        .unwrap();

    let simulate = |mc_delta: Vec<f64>| {
        MergerProblem::builder(
            observation.clone(),
            DemandSpec::Ces,
            pre_merger(),
            merger_of_one_and_two(),
        )
        .mc_delta(DVector::from_vec(mc_delta))
        .build()
        .unwrap()
        .simulate(&SimulationOptions::default())
        .unwrap()
    };
    let plain = simulate(vec![0.0, 0.0, 0.0]);
    let efficient = simulate(vec![-0.4, -0.4, 0.0]);

    assert_relative_eq!(efficient.calibration().parameters[0], 4.0, epsilon = 1e-4);
    let plain_changes = plain.price_changes();
    let efficient_changes = efficient.price_changes();
    assert!(plain_changes[0] > 0.0 && plain_changes[1] > 0.0);
    assert!(efficient_changes[0] < plain_changes[0]);
    assert!(efficient_changes[1] < plain_changes[1]);
}

#[test]
fn aids_pipeline_with_calibrated_market_elasticity() {
    let result = MergerProblem::new(
        scenario_a(),
        DemandSpec::Aids {
            market_elasticity: None,
        },
        pre_merger(),
        merger_of_one_and_two(),
    )
    .unwrap()
    .simulate(&SimulationOptions::default())
    .unwrap();
    let parameters = &result.calibration().parameters;
    assert_eq!(parameters.len(), 4);
    assert!(parameters[3] < 0.0);
    let quantities = result.quantities(MarketState::PreMerger).unwrap();
    assert_relative_eq!(quantities, scenario_a().quantities().clone(), epsilon = 1e-6);
    let changes = result.price_changes();
    assert!(changes[0] > 0.0 && changes[1] > 0.0);
}

#[test]
fn implausible_margins_surface_negative_costs_as_warnings() {
    // A cost shift below -100% makes the post-merger cost negative.
    let result = MergerProblem::builder(
        scenario_a(),
        DemandSpec::linear(),
        pre_merger(),
        merger_of_one_and_two(),
    )
    .mc_delta(DVector::from_vec(vec![-1.2, 0.0, 0.0]))
    .build()
    .unwrap()
    .simulate(&SimulationOptions::default())
    .unwrap();
    assert!(result.warnings().iter().any(|warning| matches!(
        warning,
        ValidityWarning::NegativeMarginalCost {
            state: MarketState::PostMerger,
            index: 0,
            ..
        }
    )));
}

#[test]
fn priced_out_product_surfaces_negative_quantity_warning() {
    // Tripling product 2's cost after the merger drives its unconstrained demand below zero.
    let result = MergerProblem::builder(
        scenario_a(),
        DemandSpec::linear(),
        pre_merger(),
        merger_of_one_and_two(),
    )
    .mc_delta(DVector::from_vec(vec![0.0, 2.0, 0.0]))
    .build()
    .unwrap()
    .simulate(&SimulationOptions::default())
    .unwrap();

    assert!(result.warnings().iter().any(|warning| matches!(
        warning,
        ValidityWarning::NegativeQuantity {
            state: MarketState::PostMerger,
            index: 1,
            quantity,
        } if *quantity < 0.0
    )));
    assert!(!result.warnings().iter().any(|warning| matches!(
        warning,
        ValidityWarning::NegativeQuantity {
            state: MarketState::PreMerger,
            ..
        }
    )));
    let quantities = result.quantities(MarketState::PostMerger).unwrap();
    assert_relative_eq!(quantities[1], 0.0, epsilon = 1e-8);
    assert!(quantities[0] > 0.0 && quantities[2] > 0.0);
}
