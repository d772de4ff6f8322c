mod common;

use common::{FakeBackend, FakeCompiler, RecordingChecker, SharedOutput};
use convsweep::correctness::{CheckCase, ReferenceChecker, Verdict};
use convsweep::target::{self, ResolvedTarget};
use convsweep::{
    ArtifactBuilder, Configuration, Correctness, DType, DataLayout, FailureStage,
    ScheduleStrategy, SweepDriver, SweepPlan, SweepReport, WorkloadSet, WorkloadSpec,
};
use rstest::rstest;
use std::collections::HashSet;

const SMALL: &[WorkloadSpec] = &[
    WorkloadSpec::standard(8, 4, 8, 3, 1, 1).with_repeats(1, 2),
    WorkloadSpec::standard(8, 8, 8, 1, 1, 0).with_repeats(1, 2),
    WorkloadSpec::depthwise(8, 4, 3, 2, 1).with_repeats(1, 2),
    WorkloadSpec::depthwise(6, 8, 5, 1, 2).with_repeats(1, 2),
];

fn fake_driver(
    compiler: FakeCompiler,
    backend: FakeBackend,
    checker: Box<dyn ReferenceChecker>,
    out: &SharedOutput,
) -> SweepDriver<FakeCompiler> {
    SweepDriver::new("host", ArtifactBuilder::new(compiler), Box::new(backend))
        .with_checker(checker)
        .with_seed(7)
        .with_output(Box::new(out.clone()))
}

fn configuration(dtype: DType, layout: &str) -> Configuration {
    Configuration {
        arch: "host".to_string(),
        target: "cpu".to_string(),
        dtype,
        layout: layout.to_string(),
        workload_set: WorkloadSet::Caffe2Standard,
        strategy: ScheduleStrategy::Auto,
    }
}

fn host_cpu() -> ResolvedTarget {
    target::resolve("host", "cpu").unwrap()
}

#[test]
fn test_every_cell_reported_once() {
    common::setup();
    let out = SharedOutput::default();
    let backend = FakeBackend::default();
    let loads = backend.loads.clone();
    let mut driver = fake_driver(
        FakeCompiler::default(),
        backend,
        Box::new(RecordingChecker::default()),
        &out,
    );
    // Unknown layouts keep every cell cheap: each one stops at scheduling.
    let plan = SweepPlan {
        layouts: vec!["NCWH".to_string(), "WHCN".to_string()],
        ..SweepPlan::default()
    };

    let report = driver.run(&plan);

    assert_eq!(report.results().len(), plan.attempt_count());
    let cells: HashSet<_> = report
        .results()
        .iter()
        .map(|r| (r.configuration.clone(), r.workload_index))
        .collect();
    assert_eq!(cells.len(), plan.attempt_count());
    assert!(report
        .results()
        .iter()
        .all(|r| r.failure_stage == Some(FailureStage::Schedule) && r.mean_cost.is_none()));
    assert!(loads.lock().unwrap().is_empty());

    let lines = out.lines();
    assert_eq!(lines.len(), 2 * plan.attempt_count() + 1);
    assert!(lines.last().unwrap().starts_with("summary:"));
}

#[test]
fn test_unknown_layout_fails_at_schedule() {
    common::setup();
    let out = SharedOutput::default();
    let mut driver = fake_driver(
        FakeCompiler::default(),
        FakeBackend::default(),
        Box::new(RecordingChecker::default()),
        &out,
    );
    let mut report = SweepReport::new();
    let config = configuration(DType::I8, "NCWH");

    driver.run_configuration(&config, &host_cpu(), &SMALL[..1], &mut report);

    let result = &report.results()[0];
    assert_eq!(result.failure_stage, Some(FailureStage::Schedule));
    assert_eq!(result.mean_cost, None);
    assert_eq!(result.correctness, Correctness::Skipped);
    assert!(result.message.as_deref().unwrap().contains("NCWH"));

    let lines = out.lines();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("layout: NCWH"));
    assert!(lines[0].ends_with("input_shape: ?, filter_shape: ? -> build"));
    assert!(lines[1].contains("-> schedule skip:"));
}

#[test]
fn test_unsupported_target_skipped() {
    common::setup();
    let out = SharedOutput::default();
    let mut driver = fake_driver(
        FakeCompiler::default(),
        FakeBackend::default(),
        Box::new(RecordingChecker::default()),
        &out,
    );
    let plan = SweepPlan {
        targets: vec!["cpu".to_string(), "opencl".to_string()],
        layouts: vec!["NCWH".to_string()],
        ..SweepPlan::default()
    };

    let report = driver.run(&plan);

    assert_eq!(report.skipped_targets().len(), 1);
    assert_eq!(report.skipped_targets()[0].target, "opencl");
    assert_eq!(report.results().len(), plan.attempt_count() / 2);
    assert!(report.results().iter().all(|r| r.configuration.target == "cpu"));
    assert!(!out.lines().iter().any(|line| line.contains("opencl")));
    assert_eq!(report.summary().skipped_targets, 1);
}

#[test]
fn test_failures_stay_in_their_cell() {
    common::setup();
    let out = SharedOutput::default();
    let compiler = FakeCompiler {
        reject: vec![SMALL[1].function_name(1)],
    };
    let backend = FakeBackend {
        fail: vec![SMALL[2].function_name(2)],
        panic: vec![SMALL[3].function_name(3)],
        ..FakeBackend::default()
    };
    let mut driver = fake_driver(compiler, backend, Box::new(RecordingChecker::default()), &out);
    let mut report = SweepReport::new();

    driver.run_configuration(&configuration(DType::F32, "NCHW"), &host_cpu(), SMALL, &mut report);
    driver.run_configuration(&configuration(DType::F32, "NHWC"), &host_cpu(), &SMALL[..1], &mut report);

    let stages: Vec<_> = report.results().iter().map(|r| r.failure_stage).collect();
    assert_eq!(
        stages,
        vec![
            None,
            Some(FailureStage::Build),
            Some(FailureStage::Run),
            Some(FailureStage::Run),
            None,
        ]
    );
    assert_eq!(report.results()[0].mean_cost, Some(1e-3));
    assert!(report.results()[3].message.as_deref().unwrap().contains("device driver crashed"));

    let lines = out.lines();
    assert!(lines.iter().any(|l| l.contains("-> failed: build failed")));
    assert_eq!(lines.iter().filter(|l| l.contains("-> run skip:")).count(), 2);
    assert_eq!(lines.iter().filter(|l| l.ends_with(", correct")).count(), 2);
}

#[test]
fn test_depthwise_int8_accumulates_in_int32() {
    common::setup();
    let out = SharedOutput::default();
    let checker = RecordingChecker::default();
    let cases = checker.cases.clone();
    let mut driver = fake_driver(
        FakeCompiler::default(),
        FakeBackend::default(),
        Box::new(checker),
        &out,
    );
    let mut report = SweepReport::new();
    let workload = [WorkloadSpec::depthwise(8, 4, 3, 1, 1).with_repeats(1, 1)];

    driver.run_configuration(&configuration(DType::I8, "NHWC"), &host_cpu(), &workload, &mut report);

    assert!(report.results()[0].is_success());
    assert_eq!(report.results()[0].phase, "depthwise");
    let cases = cases.lock().unwrap();
    assert_eq!(cases.len(), 1);
    assert_eq!(cases[0].dtype, DType::I8);
    assert_eq!(cases[0].output_dtype, DType::I32);
    assert_eq!(cases[0].layout, DataLayout::Nhwc);
    assert!(cases[0].depthwise);
    assert_eq!(cases[0].output_shape, vec![1, 8, 8, 4]);
    let prefix = format!(
        "depthwise--target: {}, dtype: int8, layout: NHWC",
        host_cpu().compile_target
    );
    assert!(out.lines()[0].starts_with(&prefix));
}

struct DisagreeingChecker;

impl ReferenceChecker for DisagreeingChecker {
    fn check(&self, _case: &CheckCase<'_>) -> Verdict {
        Verdict::Mismatch {
            diagnostic: "3 of 256 elements differ".to_string(),
        }
    }
}

struct PanickingChecker;

impl ReferenceChecker for PanickingChecker {
    fn check(&self, _case: &CheckCase<'_>) -> Verdict {
        panic!("reference blew up")
    }
}

#[rstest]
#[case::disagreeing(Box::new(DisagreeingChecker), "3 of 256 elements differ")]
#[case::panicking(Box::new(PanickingChecker), "reference blew up")]
fn test_mismatch_is_reported_not_fatal(
    #[case] checker: Box<dyn ReferenceChecker>,
    #[case] expected: &str,
) {
    common::setup();
    let out = SharedOutput::default();
    let mut driver = fake_driver(FakeCompiler::default(), FakeBackend::default(), checker, &out);
    let mut report = SweepReport::new();

    driver.run_configuration(&configuration(DType::F32, "HWCN"), &host_cpu(), &SMALL[..2], &mut report);

    assert_eq!(report.results().len(), 2);
    for result in report.results() {
        assert!(result.is_success());
        match &result.correctness {
            Correctness::Mismatch(diagnostic) => assert!(diagnostic.contains(expected)),
            other => panic!("expected a mismatch, got {other:?}"),
        }
    }
    assert_eq!(report.summary().mismatched, 2);
    assert!(out.lines().iter().any(|l| l.contains("MISMATCH")));
}

#[test]
fn test_full_grid_over_small_workloads() {
    common::setup();
    let out = SharedOutput::default();
    let mut driver = fake_driver(
        FakeCompiler::default(),
        FakeBackend::default(),
        Box::new(RecordingChecker::default()),
        &out,
    );
    let plan = SweepPlan::default();
    let mut report = SweepReport::new();

    let configurations = plan.configurations("host", "cpu");
    for config in &configurations {
        driver.run_configuration(config, &host_cpu(), SMALL, &mut report);
    }

    assert_eq!(report.results().len(), configurations.len() * SMALL.len());
    assert!(report.results().iter().all(|r| r.is_success()));
    assert_eq!(report.summary().succeeded, configurations.len() * SMALL.len());
}

#[test]
fn test_operands_do_not_depend_on_earlier_cells() {
    common::setup();
    let later = WorkloadSpec::depthwise(8, 4, 3, 1, 1).with_repeats(1, 1);
    let broken = WorkloadSpec {
        output_channel: 6,
        ..WorkloadSpec::depthwise(8, 4, 3, 1, 1)
    };
    let config = configuration(DType::F32, "NCHW");

    let mut inputs = Vec::new();
    for first in [later, broken] {
        let out = SharedOutput::default();
        let checker = RecordingChecker::default();
        let cases = checker.cases.clone();
        let mut driver = fake_driver(
            FakeCompiler::default(),
            FakeBackend::default(),
            Box::new(checker),
            &out,
        );
        let mut report = SweepReport::new();
        driver.run_configuration(&config, &host_cpu(), &[first, later], &mut report);
        assert!(report.results()[1].is_success());
        let cases = cases.lock().unwrap();
        inputs.push(cases.last().unwrap().input.clone());
    }

    // the broken run fails at scheduling and never allocates its operands
    assert_eq!(inputs[0], inputs[1]);
}
