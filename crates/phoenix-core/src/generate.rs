//! Test generation.
//!
//! Boot tests come from the board's processor and memory facts; feature
//! tests come from its capabilities and requirements. The two generators are
//! independent and run in parallel on the rayon pool.

use std::collections::HashSet;

use phoenix_types::{Capability, Emulator, HardwareSpec, Requirement, Severity, TestCase, TestCategory, TestStep};

/// Output of both generators, kept apart until unioned.
#[derive(Debug, Clone, Default)]
pub struct GeneratedTests {
    pub boot: Vec<TestCase>,
    pub feature: Vec<TestCase>,
}

impl GeneratedTests {
    /// Boot tests first, then feature tests; a repeated id keeps the first.
    pub fn into_suite(self) -> Vec<TestCase> {
        let mut seen = HashSet::new();
        self.boot
            .into_iter()
            .chain(self.feature)
            .filter(|t| seen.insert(t.id.clone()))
            .collect()
    }
}

/// Run both generators concurrently. CPU-bound; call off the async runtime.
pub fn generate_all(emulator: &Emulator) -> GeneratedTests {
    let (boot, feature) = rayon::join(
        || boot_tests(&emulator.board_name, &emulator.hardware, &emulator.requirements),
        || feature_tests(&emulator.capabilities, &emulator.requirements),
    );
    GeneratedTests { boot, feature }
}

fn steps(pairs: &[(&str, &str)]) -> Vec<TestStep> {
    pairs.iter().map(|(a, e)| TestStep::new(*a, *e)).collect()
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[allow(clippy::too_many_arguments)]
fn boot_case(
    id: &str,
    name: &str,
    severity: Severity,
    description: String,
    preconditions: &[&str],
    step_pairs: &[(&str, &str)],
    expected: Vec<String>,
    timeout_sec: u64,
) -> TestCase {
    TestCase {
        description,
        preconditions: strings(preconditions),
        steps: steps(step_pairs),
        expected_results: expected,
        timeout_sec,
        ..TestCase::new(id, name, TestCategory::Boot, severity)
    }
}

pub fn boot_tests(board_name: &str, hw: &HardwareSpec, requirements: &[Requirement]) -> Vec<TestCase> {
    let mut tests = vec![
        boot_case(
            "BOOT_COLD_001",
            "Cold Boot Sequence Test",
            Severity::Critical,
            format!("Verify cold boot sequence for {board_name}"),
            &["Device is powered off", "Firmware is loaded"],
            &[
                ("Power on device", "Boot sequence starts"),
                ("Monitor bootloader stage", "Bootloader initializes within 5s"),
                ("Monitor kernel stage", "Kernel loads within 30s"),
                ("Monitor rootfs mount", "Root filesystem mounts"),
                ("Monitor services", "All critical services start"),
            ],
            strings(&[
                "Boot completes within 120 seconds",
                "All boot stages complete successfully",
                "No error messages in boot log",
            ]),
            180,
        ),
        boot_case(
            "BOOT_WARM_001",
            "Warm Boot (Reboot) Test",
            Severity::Critical,
            "Verify warm boot/reboot sequence".into(),
            &["Device is running", "System is stable"],
            &[
                ("Issue reboot command", "Reboot initiated"),
                ("Monitor shutdown sequence", "Services stop gracefully"),
                ("Monitor boot sequence", "System reboots"),
            ],
            strings(&[
                "Reboot completes within 60 seconds",
                "All services restart correctly",
            ]),
            90,
        ),
        boot_case(
            "BOOT_TIME_001",
            "Boot Timing Verification",
            Severity::High,
            "Verify boot timing meets requirements".into(),
            &["Device is powered off"],
            &[
                ("Start timing at power-on", "Timer starts"),
                ("Record bootloader time", "Bootloader completes"),
                ("Record kernel time", "Kernel ready"),
                ("Record total boot time", "System fully operational"),
            ],
            strings(&[
                "Bootloader stage < 10 seconds",
                "Kernel initialization < 30 seconds",
                "Total boot time < 120 seconds",
            ]),
            180,
        ),
        boot_case(
            "BOOT_WDT_001",
            "Watchdog Timer Test",
            Severity::High,
            "Verify watchdog timer functionality".into(),
            &["Device is running", "Watchdog is enabled"],
            &[
                ("Verify watchdog is active", "Watchdog daemon running"),
                ("Simulate system hang", "Watchdog detects hang"),
                ("Wait for watchdog timeout", "System reboots automatically"),
            ],
            strings(&["Watchdog triggers reboot on hang", "System recovers after watchdog reset"]),
            120,
        ),
        boot_case(
            "BOOT_INTEGRITY_001",
            "Bootloader Integrity Verification",
            Severity::Critical,
            "Verify bootloader integrity and secure boot".into(),
            &["Fresh boot"],
            &[
                ("Check bootloader signature", "Signature valid"),
                ("Verify boot chain", "Chain of trust intact"),
                ("Check secure boot status", "Secure boot enabled"),
            ],
            strings(&["Bootloader signature verification passes", "Boot chain integrity verified"]),
            60,
        ),
        boot_case(
            "BOOT_RECOVERY_001",
            "Boot Recovery Mode Test",
            Severity::Medium,
            "Verify boot recovery mode functionality".into(),
            &["Recovery mode accessible"],
            &[
                ("Enter recovery mode", "Recovery mode activates"),
                ("Verify recovery options", "Options available"),
                ("Exit recovery mode", "Normal boot resumes"),
            ],
            strings(&["Recovery mode accessible", "Firmware update option available"]),
            180,
        ),
        boot_case(
            "BOOT_MEM_001",
            "Memory Initialization Test",
            Severity::High,
            format!("Verify {} MB of {} is detected and usable", hw.memory.size_mb, hw.memory.kind),
            &["Device is powered off"],
            &[
                ("Power on device", "Memory controller initializes"),
                ("Read detected memory size", "Reported size matches the hardware"),
                ("Run memory pattern check", "No bit errors"),
            ],
            vec![
                format!("{} MB {} detected", hw.memory.size_mb, hw.memory.kind),
                "Memory pattern check passes".into(),
            ],
            120,
        ),
        boot_case(
            "BOOT_CPU_001",
            "CPU Bring-up Test",
            Severity::High,
            format!(
                "Verify all {} {} cores come online at {} MHz",
                hw.cpu.cores, hw.cpu.cpu_type, hw.cpu.frequency_mhz
            ),
            &["Device is powered off"],
            &[
                ("Power on device", "Boot core starts"),
                ("Bring up secondary cores", "Secondary cores online"),
                ("Read CPU frequency", "Frequency matches the hardware"),
            ],
            vec![
                format!("{} of {} cores online", hw.cpu.cores, hw.cpu.cores),
                format!("Clock at {} MHz", hw.cpu.frequency_mhz),
            ],
            90,
        ),
    ];

    let boot_reqs: Vec<String> = requirements
        .iter()
        .filter(|r| r.title.to_lowercase().contains("boot") || r.description.to_lowercase().contains("boot"))
        .take(2)
        .map(|r| r.id.clone())
        .collect();
    for test in &mut tests {
        test.linked_requirements = boot_reqs.clone();
    }
    tests
}

pub fn feature_tests(capabilities: &[Capability], requirements: &[Requirement]) -> Vec<TestCase> {
    let mut tests: Vec<TestCase> = capabilities
        .iter()
        .filter(|c| c.testable)
        .map(|cap| capability_test(cap, requirements))
        .collect();

    let linked: HashSet<String> = tests
        .iter()
        .flat_map(|t| t.linked_requirements.iter().cloned())
        .collect();
    tests.extend(
        requirements
            .iter()
            .filter(|r| !linked.contains(&r.id))
            .map(requirement_test),
    );
    tests
}

fn capability_test(cap: &Capability, requirements: &[Requirement]) -> TestCase {
    let name_lower = cap.name.to_lowercase();
    let linked_requirements = requirements
        .iter()
        .filter(|r| {
            r.description.to_lowercase().contains(&name_lower) || r.linked_capabilities.contains(&cap.id)
        })
        .take(3)
        .map(|r| r.id.clone())
        .collect();

    TestCase {
        description: format!("Verify basic functionality of {}", cap.name),
        preconditions: vec![format!("{} is enabled", cap.name), "System is stable".into()],
        steps: vec![
            TestStep::new(format!("Initialize {}", cap.name), "Initialization successful"),
            TestStep::new(format!("Verify {} status", cap.name), "Status is operational"),
            TestStep::new("Perform basic operation", "Operation completes"),
        ],
        expected_results: vec![
            format!("{} initializes correctly", cap.name),
            format!("{} performs expected function", cap.name),
        ],
        linked_requirements,
        linked_capabilities: vec![cap.id.clone()],
        ..TestCase::new(
            format!("{}_FUNC_001", cap.id),
            format!("{} - Basic Functionality", cap.name),
            TestCategory::from_label(&cap.category),
            Severity::High,
        )
    }
}

fn requirement_test(req: &Requirement) -> TestCase {
    let mut steps = vec![TestStep::new("Execute test scenario", "Requirement met")];
    steps.extend(
        req.acceptance_criteria
            .iter()
            .take(3)
            .map(|c| TestStep::new(format!("Verify: {c}"), "Pass")),
    );
    let expected_results = if req.acceptance_criteria.is_empty() {
        vec!["Requirement satisfied".to_string()]
    } else {
        req.acceptance_criteria.clone()
    };

    TestCase {
        description: format!("Verify requirement: {}", req.description),
        preconditions: vec!["System is operational".into()],
        steps,
        expected_results,
        timeout_sec: 120,
        linked_requirements: vec![req.id.clone()],
        ..TestCase::new(
            format!("REQ_{}_TEST", req.id),
            format!("Requirement: {}", req.title),
            TestCategory::from_label(&req.category),
            req.severity,
        )
    }
}
