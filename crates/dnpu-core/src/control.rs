//! Electrode bookkeeping for device surrogates.
//!
//! A physical device exposes a fixed set of electrodes; the ones not driven
//! by the task input carry the trainable control voltages.

use crate::error::{Error, Result};

/// Returns the control-electrode indices: the ascending complement of
/// `input_indices` within `0..electrode_count`.
pub fn control_voltage_indices(input_indices: &[usize], electrode_count: usize) -> Result<Vec<usize>> {
    if electrode_count == 0 {
        return Err(Error::InvalidValue {
            label: "input_electrode_no",
        });
    }
    if input_indices.len() >= electrode_count {
        return Err(Error::Config {
            message: format!(
                "{} input electrodes leave no control electrodes out of {}",
                input_indices.len(),
                electrode_count
            ),
        });
    }
    let mut used = vec![false; electrode_count];
    for &index in input_indices {
        if index >= electrode_count {
            return Err(Error::Config {
                message: format!(
                    "input electrode {index} out of range for {electrode_count} electrodes"
                ),
            });
        }
        if used[index] {
            return Err(Error::Config {
                message: format!("input electrode {index} listed twice"),
            });
        }
        used[index] = true;
    }
    Ok((0..electrode_count).filter(|&i| !used[i]).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complement_is_ascending() {
        let controls = control_voltage_indices(&[0, 4], 7).unwrap();
        assert_eq!(controls, vec![1, 2, 3, 5, 6]);
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        assert!(control_voltage_indices(&[7], 7).is_err());
    }

    #[test]
    fn duplicate_index_is_rejected() {
        assert!(control_voltage_indices(&[2, 2], 7).is_err());
    }

    #[test]
    fn all_inputs_is_rejected() {
        assert!(control_voltage_indices(&[0, 1], 2).is_err());
    }

    #[test]
    fn zero_electrodes_is_rejected() {
        assert!(control_voltage_indices(&[], 0).is_err());
    }
}
