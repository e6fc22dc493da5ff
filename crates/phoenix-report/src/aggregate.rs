use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use phoenix_types::{
    new_id, BootAnalysis, CategoryCoverage, FeatureCoverage, FirmwareInfo, ReportOutcome,
    Severity, Summary, TestCase, TestCategory, TestResult, TestStatus, Verdict,
    VerificationReport,
};
use serde::{Deserialize, Serialize};

/// Test cases grouped by category, each group in execution order.
pub type CasesByCategory<'a> = BTreeMap<TestCategory, Vec<&'a TestCase>>;

/// Group test cases by category, preserving their relative order.
pub fn by_category(cases: &[TestCase]) -> CasesByCategory<'_> {
    let mut grouped: CasesByCategory<'_> = BTreeMap::new();
    for case in cases {
        grouped.entry(case.category).or_default().push(case);
    }
    grouped
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Pass rate (percent) below which the verdict is FAIL.
    pub conditional_floor: f64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            conditional_floor: 80.0,
        }
    }
}

/// Who and what a report is about.
#[derive(Debug, Clone, Default)]
pub struct ReportContext {
    pub session_id: Option<String>,
    pub workflow_id: Option<String>,
    pub emulator_id: String,
    pub board_name: String,
    pub firmware: Option<FirmwareInfo>,
}

#[derive(Debug, Clone, Default)]
pub struct ReportAggregator {
    config: AggregatorConfig,
}

#[derive(Default)]
struct Tally {
    passed: usize,
    failed: usize,
    errors: usize,
    critical_failed: bool,
}

impl Tally {
    fn total(&self) -> usize {
        self.passed + self.failed
    }
}

impl ReportAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Compute verdict, summary, recommendations and coverage.
    ///
    /// Every case in `cases` counts toward the totals; a case with no
    /// matching result counts as `error`. Results for unknown test ids are
    /// ignored, and only the first result per test id is considered.
    pub fn aggregate(&self, results: &[TestResult], cases: &CasesByCategory<'_>) -> ReportOutcome {
        let mut by_id: HashMap<&str, &TestResult> = HashMap::new();
        for r in results {
            by_id.entry(r.test_id.as_str()).or_insert(r);
        }

        let mut overall = Tally::default();
        let mut by_category = BTreeMap::new();
        let mut recommendations = Vec::new();
        let mut boot = BootAnalysis::default();
        let mut duration_sec = 0.0;

        for (category, group) in cases {
            let mut tally = Tally::default();
            for case in group {
                let result = by_id.get(case.id.as_str());
                let status = result.map_or(TestStatus::Error, |r| r.status);
                let duration = result.map_or(0.0, |r| r.duration_sec);
                duration_sec += duration;

                match status {
                    TestStatus::Passed => tally.passed += 1,
                    TestStatus::Failed => tally.failed += 1,
                    TestStatus::Error => {
                        tally.failed += 1;
                        tally.errors += 1;
                    }
                }
                if status != TestStatus::Passed && case.severity == Severity::Critical {
                    tally.critical_failed = true;
                }
                if *category == TestCategory::Boot {
                    boot.tests_run += 1;
                    boot.boot_time_sec += duration;
                    if status == TestStatus::Passed {
                        boot.tests_passed += 1;
                    }
                }
            }

            if tally.failed > 0 {
                recommendations.push(recommendation(*category, &tally));
            }
            by_category.insert(
                category.as_str().to_string(),
                CategoryCoverage {
                    passed: tally.passed,
                    total: tally.total(),
                    coverage: percent(tally.passed, tally.total()),
                },
            );

            overall.passed += tally.passed;
            overall.failed += tally.failed;
            overall.errors += tally.errors;
            overall.critical_failed |= tally.critical_failed;
        }

        let total = overall.total();
        let pass_rate = percent(overall.passed, total);
        let verdict = if overall.critical_failed || pass_rate < self.config.conditional_floor {
            Verdict::Fail
        } else if total > 0 && overall.passed == total {
            // Exact counts: a rounded 100.0 with a failure is not a pass.
            Verdict::Pass
        } else {
            Verdict::Conditional
        };
        boot.all_passed = boot.tests_run > 0 && boot.tests_passed == boot.tests_run;

        let fully_covered = by_category
            .values()
            .filter(|c: &&CategoryCoverage| c.total > 0 && c.passed == c.total)
            .count();

        ReportOutcome {
            verdict,
            summary: Summary {
                passed: overall.passed,
                failed: overall.failed,
                total,
                pass_rate,
                errors: overall.errors,
                degenerate: total == 0,
            },
            recommendations,
            feature_coverage: FeatureCoverage {
                total_categories: by_category.len(),
                fully_covered,
                by_category,
            },
            boot_analysis: boot,
            duration_sec,
        }
    }

    /// Aggregate and stamp a new report id and timestamp.
    ///
    /// `cases` is the full suite in execution order; the report carries one
    /// result per case, with missing results filled in as `error`.
    pub fn report(
        &self,
        ctx: ReportContext,
        results: &[TestResult],
        cases: &[TestCase],
    ) -> VerificationReport {
        let outcome = self.aggregate(results, &by_category(cases));
        let test_results = cases
            .iter()
            .map(|case| {
                results
                    .iter()
                    .find(|r| r.test_id == case.id)
                    .cloned()
                    .unwrap_or_else(|| TestResult::not_run(&case.id, "no result recorded"))
            })
            .collect();

        let report = VerificationReport {
            report_id: new_id("RPT"),
            session_id: ctx.session_id,
            workflow_id: ctx.workflow_id,
            emulator_id: ctx.emulator_id,
            board_name: ctx.board_name,
            firmware: ctx.firmware,
            created_at: Utc::now(),
            outcome,
            test_results,
        };
        tracing::debug!(
            report_id = %report.report_id,
            verdict = %report.outcome.verdict,
            pass_rate = report.outcome.summary.pass_rate,
            "Generated report"
        );
        report
    }
}

/// `round(part / whole * 100, 1)`, or 0 when `whole == 0`.
fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    (part as f64 / whole as f64 * 1000.0).round() / 10.0
}

fn recommendation(category: TestCategory, tally: &Tally) -> String {
    let hint = match category {
        TestCategory::Boot => "Review bootloader configuration.",
        TestCategory::Security => "Security failures require immediate attention.",
        TestCategory::Network => "Verify network driver configuration.",
        TestCategory::Wifi => "Check wireless chipset drivers and firmware.",
        _ => "Review the failed tests for root cause analysis.",
    };
    let prefix = if tally.critical_failed { "CRITICAL: " } else { "" };
    format!(
        "{prefix}{category}: {} of {} test(s) failed. {hint}",
        tally.failed,
        tally.total()
    )
}
