use crate::{poll_counter, CounterEmitter, CounterSink, SamplingTask, LSASS_CPU_MEASUREMENT, MACHINE_CPU_MEASUREMENT};
use anyhow::Result;
use oxbench_common::types::{MeasurementMetadata, Operation, AGENT_SOURCE};
use std::ffi::OsStr;
use std::time::Duration;
use sysinfo::{ProcessesToUpdate, System, MINIMUM_CPU_UPDATE_INTERVAL};

pub const PROCESSOR_TIME_COUNTER: &str = "processor-time";

/// Machine wide CPU usage read from the processor time counters.
pub struct WindowsMachineCpuEmitter {
    interval: Duration,
    task: SamplingTask,
}

impl WindowsMachineCpuEmitter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(MINIMUM_CPU_UPDATE_INTERVAL),
            task: SamplingTask::default(),
        }
    }
}

impl CounterEmitter for WindowsMachineCpuEmitter {
    fn counter_name(&self) -> &str {
        PROCESSOR_TIME_COUNTER
    }

    fn measurement_name(&self) -> &str {
        MACHINE_CPU_MEASUREMENT
    }

    fn metadata(&self) -> MeasurementMetadata {
        machine_cpu_metadata()
    }

    fn start(&mut self, sink: &CounterSink) -> Result<()> {
        let mut system = System::new();
        system.refresh_cpu_all();

        self.task.spawn(poll_counter(
            sink.clone(),
            PROCESSOR_TIME_COUNTER.to_string(),
            self.interval,
            move || {
                system.refresh_cpu_all();
                Some(f64::from(system.global_cpu_usage()))
            },
        ))
    }

    fn dispose(&mut self) -> Result<()> {
        self.task.abort();
        Ok(())
    }
}

/// CPU usage of a single named process, normalised to the whole machine.
pub struct WindowsProcessCpuEmitter {
    process_name: String,
    counter_name: String,
    interval: Duration,
    task: SamplingTask,
}

impl WindowsProcessCpuEmitter {
    pub fn new(process_name: impl Into<String>, interval: Duration) -> Self {
        let process_name = process_name.into();
        let stem = process_name
            .strip_suffix(".exe")
            .unwrap_or(&process_name)
            .to_lowercase();
        Self {
            counter_name: format!("{stem}-cpu"),
            process_name,
            interval: interval.max(MINIMUM_CPU_UPDATE_INTERVAL),
            task: SamplingTask::default(),
        }
    }

    pub fn process_name(&self) -> &str {
        &self.process_name
    }
}

impl CounterEmitter for WindowsProcessCpuEmitter {
    fn counter_name(&self) -> &str {
        &self.counter_name
    }

    fn measurement_name(&self) -> &str {
        LSASS_CPU_MEASUREMENT
    }

    fn metadata(&self) -> MeasurementMetadata {
        MeasurementMetadata {
            source: AGENT_SOURCE.to_string(),
            name: LSASS_CPU_MEASUREMENT.to_string(),
            aggregate: Operation::Max,
            reduce: Operation::Max,
            format: "n0".to_string(),
            long_description: format!("Amount of time the {} process uses the CPU (%)", self.process_name),
            short_description: "Max CPU Usage lsass (%)".to_string(),
        }
    }

    fn start(&mut self, sink: &CounterSink) -> Result<()> {
        let cores = std::thread::available_parallelism().map_or(1, |n| n.get()) as f64;
        let process_name = self.process_name.clone();
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);

        self.task.spawn(poll_counter(
            sink.clone(),
            self.counter_name.clone(),
            self.interval,
            move || {
                system.refresh_processes(ProcessesToUpdate::All, true);
                let mut found = false;
                let usage: f32 = system
                    .processes_by_exact_name(OsStr::new(&process_name))
                    .map(|p| {
                        found = true;
                        p.cpu_usage()
                    })
                    .sum();
                found.then(|| f64::from(usage) / cores)
            },
        ))
    }

    fn dispose(&mut self) -> Result<()> {
        self.task.abort();
        Ok(())
    }
}

pub(crate) fn machine_cpu_metadata() -> MeasurementMetadata {
    MeasurementMetadata {
        source: AGENT_SOURCE.to_string(),
        name: MACHINE_CPU_MEASUREMENT.to_string(),
        aggregate: Operation::Max,
        reduce: Operation::Max,
        format: "n0".to_string(),
        long_description: "Amount of time the machine CPU is in use (%)".to_string(),
        short_description: "Max Machine CPU Usage (%)".to_string(),
    }
}
