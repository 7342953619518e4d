//! Error injection for the simulated device.
//!
//! Every transport call is checked against an [`ErrorConfig`] before it
//! touches device state. Operations are named after the transport call:
//! `control_out`, `control_in`, `bulk_read`, `bulk_write`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use scan_core::{Result, ScanError};

/// Scripted transport failures, shared between the test and the device.
#[derive(Clone, Debug, Default)]
pub struct ErrorConfig {
    scenarios: Arc<Vec<ErrorScenario>>,
    state: Arc<Mutex<ErrorState>>,
}

/// Scripted failure.
#[derive(Debug, Clone)]
pub enum ErrorScenario {
    /// Fail every call of `operation` after the first `count`
    FailAfterN {
        /// Transport operation name.
        operation: &'static str,
        /// Calls that succeed.
        count: u32,
    },
    /// Every call of `operation` times out
    Timeout {
        /// Transport operation name.
        operation: &'static str,
    },
    /// The bus goes away on the next call and stays gone
    CommunicationLoss,
    /// The device latches a fault code on the next call
    HardwareFault {
        /// Reported code.
        code: u32,
    },
}

#[derive(Default, Debug)]
struct ErrorState {
    operation_counts: HashMap<&'static str, u32>,
    communication_lost: bool,
    /// 0 = no fault
    hardware_fault_code: u32,
}

impl ErrorConfig {
    /// No injected errors.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// A single scenario.
    #[must_use]
    pub fn scenario(scenario: ErrorScenario) -> Self {
        Self::scenarios(vec![scenario])
    }

    /// Several scenarios, checked in order.
    #[must_use]
    pub fn scenarios(scenarios: Vec<ErrorScenario>) -> Self {
        Self {
            scenarios: Arc::new(scenarios),
            state: Arc::default(),
        }
    }

    /// Decide whether `operation` fails this time.
    pub fn check_operation(&self, operation: &'static str) -> Result<()> {
        let mut state = self.state.lock();

        if state.communication_lost {
            return Err(ScanError::transport(operation, "communication lost"));
        }
        if state.hardware_fault_code != 0 {
            return Err(ScanError::transport(
                operation,
                format!("hardware fault: {}", state.hardware_fault_code),
            ));
        }

        for scenario in self.scenarios.iter() {
            match scenario {
                ErrorScenario::FailAfterN {
                    operation: op,
                    count,
                } if *op == operation => {
                    let current = state.operation_counts.entry(operation).or_insert(0);
                    *current += 1;
                    if *current > *count {
                        return Err(ScanError::transport(
                            operation,
                            format!("injected failure after {count} operations"),
                        ));
                    }
                }
                ErrorScenario::Timeout { operation: op } if *op == operation => {
                    return Err(ScanError::Timeout {
                        condition: operation,
                        attempts: 1,
                    });
                }
                ErrorScenario::CommunicationLoss => {
                    state.communication_lost = true;
                    return Err(ScanError::transport(operation, "communication lost"));
                }
                ErrorScenario::HardwareFault { code } => {
                    state.hardware_fault_code = *code;
                    return Err(ScanError::transport(
                        operation,
                        format!("hardware fault: {code}"),
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Clear counters and latched faults.
    pub fn reset(&self) {
        *self.state.lock() = ErrorState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scan_core::ScanErrorKind;

    #[test]
    fn test_no_errors() {
        let config = ErrorConfig::none();
        for _ in 0..100 {
            assert!(config.check_operation("bulk_read").is_ok());
        }
    }

    #[test]
    fn test_fail_after_n() {
        let config = ErrorConfig::scenario(ErrorScenario::FailAfterN {
            operation: "bulk_read",
            count: 5,
        });
        for i in 0..5 {
            assert!(
                config.check_operation("bulk_read").is_ok(),
                "Operation {} should succeed",
                i + 1
            );
        }
        for i in 5..10 {
            assert!(
                config.check_operation("bulk_read").is_err(),
                "Operation {} should fail",
                i + 1
            );
        }
        // other operations are not counted
        assert!(config.check_operation("control_out").is_ok());
    }

    #[test]
    fn test_timeout_scenario() {
        let config = ErrorConfig::scenario(ErrorScenario::Timeout {
            operation: "control_in",
        });
        let err = config.check_operation("control_in").unwrap_err();
        assert_eq!(err.kind(), ScanErrorKind::Timeout);
        assert!(config.check_operation("control_out").is_ok());
    }

    #[test]
    fn test_communication_loss() {
        let config = ErrorConfig::scenario(ErrorScenario::CommunicationLoss);
        let err = config.check_operation("control_in").unwrap_err();
        assert_eq!(err.kind(), ScanErrorKind::Transport);
        // stays lost for every operation
        assert!(config.check_operation("bulk_write").is_err());
    }

    #[test]
    fn test_hardware_fault() {
        let config = ErrorConfig::scenario(ErrorScenario::HardwareFault { code: 0x42 });
        let err = config.check_operation("bulk_read").unwrap_err();
        assert!(err.to_string().contains("66"), "{err}");
        assert!(config.check_operation("bulk_read").is_err());
    }

    #[test]
    fn test_reset() {
        let config = ErrorConfig::scenario(ErrorScenario::FailAfterN {
            operation: "bulk_read",
            count: 2,
        });
        assert!(config.check_operation("bulk_read").is_ok());
        assert!(config.check_operation("bulk_read").is_ok());
        assert!(config.check_operation("bulk_read").is_err());

        config.reset();

        assert!(config.check_operation("bulk_read").is_ok());
        assert!(config.check_operation("bulk_read").is_ok());
        assert!(config.check_operation("bulk_read").is_err());
    }

    #[test]
    fn test_multiple_scenarios() {
        let config = ErrorConfig::scenarios(vec![
            ErrorScenario::FailAfterN {
                operation: "bulk_read",
                count: 2,
            },
            ErrorScenario::Timeout {
                operation: "bulk_write",
            },
        ]);
        assert!(config.check_operation("bulk_read").is_ok());
        assert!(config.check_operation("bulk_read").is_ok());
        assert!(config.check_operation("bulk_read").is_err());
        assert!(config.check_operation("bulk_write").is_err());
    }

    #[test]
    fn test_clones_share_counters() {
        let config = ErrorConfig::scenario(ErrorScenario::FailAfterN {
            operation: "bulk_write",
            count: 1,
        });
        let device_side = config.clone();
        assert!(device_side.check_operation("bulk_write").is_ok());
        assert!(config.check_operation("bulk_write").is_err());
        config.reset();
        assert!(device_side.check_operation("bulk_write").is_ok());
    }
}
