use crate::sampled::{SampledMachineCpuEmitter, SamplingTool};
use crate::windows::{WindowsMachineCpuEmitter, WindowsProcessCpuEmitter};
use crate::CounterEmitter;
use oxbench_common::types::{JobOptions, OperatingSystem};
use std::time::Duration;

/// The closed set of emitters the agent knows how to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitterVariant {
    WindowsMachineCpu,
    SampledMachineCpu(SamplingTool),
    WindowsProcessCpu,
}

/// Knobs shared by every emitter variant.
#[derive(Debug, Clone)]
pub struct EmitterSettings {
    pub sampling_interval: Duration,
    /// Image name of the process sampled by [`EmitterVariant::WindowsProcessCpu`].
    pub lsass_process: String,
}

impl Default for EmitterSettings {
    fn default() -> Self {
        Self {
            sampling_interval: Duration::from_secs(1),
            lsass_process: "lsass.exe".to_string(),
        }
    }
}

impl EmitterVariant {
    pub fn build(self, settings: &EmitterSettings) -> Box<dyn CounterEmitter> {
        match self {
            EmitterVariant::WindowsMachineCpu => {
                Box::new(WindowsMachineCpuEmitter::new(settings.sampling_interval))
            }
            EmitterVariant::SampledMachineCpu(tool) => {
                Box::new(SampledMachineCpuEmitter::new(tool, settings.sampling_interval))
            }
            EmitterVariant::WindowsProcessCpu => Box::new(WindowsProcessCpuEmitter::new(
                settings.lsass_process.clone(),
                settings.sampling_interval,
            )),
        }
    }
}

/// Decides which emitters apply to a job.
///
/// Machine CPU is always collected, through the processor counters on
/// Windows and a sampling tool elsewhere. The `lsass` process counter only
/// exists on Windows and only when the job asks for it.
///
/// # Examples
///
/// ```
/// use oxbench_collector::policy::{select_emitters, EmitterVariant};
/// use oxbench_collector::sampled::SamplingTool;
/// use oxbench_common::types::{JobOptions, OperatingSystem};
///
/// let options = JobOptions { collect_lsass: true };
/// assert_eq!(
///     select_emitters(OperatingSystem::Linux, &options),
///     vec![EmitterVariant::SampledMachineCpu(SamplingTool::Vmstat)]
/// );
/// assert_eq!(select_emitters(OperatingSystem::Windows, &options).len(), 2);
/// ```
pub fn select_emitters(os: OperatingSystem, options: &JobOptions) -> Vec<EmitterVariant> {
    let mut variants = Vec::with_capacity(2);

    variants.push(match os {
        OperatingSystem::Windows => EmitterVariant::WindowsMachineCpu,
        other => EmitterVariant::SampledMachineCpu(SamplingTool::for_os(other)),
    });

    if os == OperatingSystem::Windows && options.collect_lsass {
        variants.push(EmitterVariant::WindowsProcessCpu);
    }

    variants
}
