use serde::{Serialize, ser::SerializeStruct};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

use super::types::{ProcessReport, ProcessState};

impl Serialize for ProcessReport {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("ProcessReport", 5)?;
        state.serialize_field("running", &self.running)?;
        state.serialize_field("pid", &self.pid)?;
        state.serialize_field("exit_code", &self.exit_code)?;
        state.serialize_field("memory", &format!("{} MB", self.memory))?;
        state.serialize_field("cpu_usage", &format!("{:.2}%", self.cpu_usage))?;
        state.end()
    }
}

pub fn get_stats(sysinfo: &mut System, state: ProcessState) -> ProcessReport {
    match state {
        ProcessState::Running { pid } => {
            let pid = Pid::from_u32(pid);
            sysinfo.refresh_processes_specifics(
                ProcessesToUpdate::Some(&[pid]),
                true,
                ProcessRefreshKind::nothing().with_memory().with_cpu(),
            );
            let (memory, cpu_usage) = sysinfo
                .process(pid)
                .map(|process| (process.memory() / 1024 / 1024, process.cpu_usage()))
                .unwrap_or_default();
            ProcessReport {
                running: true,
                pid: Some(pid.as_u32()),
                exit_code: None,
                memory,
                cpu_usage: (cpu_usage * 100.0).round() / 100.0,
            }
        }
        ProcessState::Exited { code } => ProcessReport {
            exit_code: code,
            ..Default::default()
        },
        ProcessState::NotStarted => ProcessReport::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_own_process() {
        let mut sys = System::new();
        let report = get_stats(&mut sys, ProcessState::Running { pid: std::process::id() });
        assert!(report.running);
        assert_eq!(report.pid, Some(std::process::id()));

        let json = serde_json::to_value(&report).unwrap();
        assert!(json["memory"].as_str().unwrap().ends_with(" MB"));
        assert!(json["cpu_usage"].as_str().unwrap().ends_with('%'));
    }

    #[test]
    fn exited_process_keeps_its_code() {
        let mut sys = System::new();
        let report = get_stats(&mut sys, ProcessState::Exited { code: Some(143) });
        assert!(!report.running);
        assert_eq!(report.exit_code, Some(143));
    }
}
