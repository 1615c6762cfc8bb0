//! Provides a minimal rust wrapper for the analog-output parts of the NI-DAQmx C library.
//!
//! ## Overview
//!
//! The core of this module is the [`NiTask`] struct which represents an NI-DAQmx task. It
//! encapsulates a task handle and provides methods that map to DAQmx C-functions: creating
//! analog output channels, configuring the sample clock and the start trigger, writing data and
//! waiting for the generation to finish. [`NiBackend`] hands out `NiTask`s to the
//! [`AnalogDispatcher`](crate::analog::AnalogDispatcher).
//!
//! **Refer to implementations of the [`NiTask`] struct to see the wrapped methods and invoked
//! [DAQmx C-functions](https://www.ni.com/docs/en-US/bundle/ni-daqmx-c-api-ref/page/cdaqmx/help_file_title.html)**
//!
//! ## Safety and Error Handling
//!
//! Given that this module interfaces with a C library, every call goes through an unsafe block.
//! [`daqmx_call`] wraps each DAQmx C-function call, checks the returned status and turns
//! negative codes into [`DispatchError::Driver`] carrying the extended error information, which
//! is also logged.
//!
//! ## Cleanup and Resource Management
//!
//! The `NiTask` struct implements the `Drop` trait, clearing the DAQmx task when an instance goes
//! out of scope.

use std::ffi::CString;
use std::time::Duration;

use ndarray::Array2;
use tracing::error;

use crate::analog::{AnalogBackend, Edge, OutputTask};
use crate::error::DispatchError;

type CConstStr = *const libc::c_char;
type CCharBuf = *mut libc::c_char;
type CFloat64 = libc::c_double;
type CUint32 = libc::c_uint;
type CUint64 = libc::c_ulonglong;
type CBool32 = libc::c_uint;
type CInt32 = libc::c_int;
pub type TaskHandle = *mut libc::c_void;

pub const DAQMX_VAL_RISING: CInt32 = 10280;
pub const DAQMX_VAL_FALLING: CInt32 = 10171;
pub const DAQMX_VAL_VOLTS: CInt32 = 10348;
pub const DAQMX_VAL_FINITESAMPS: CInt32 = 10178;
pub const DAQMX_VAL_GROUPBYCHANNEL: CBool32 = 0;

/// Status returned by `DAQmxWaitUntilTaskDone` when the task is still running.
const DAQMX_ERROR_WAIT_TIMEOUT: CInt32 = -200560;

#[link(name = "NIDAQmx")]
extern "C" {
    fn DAQmxGetExtendedErrorInfo(errorString: CCharBuf, bufferSize: CUint32) -> CInt32;

    fn DAQmxCreateTask(taskName: CConstStr, taskHandle_ptr: &mut TaskHandle) -> CInt32;
    fn DAQmxStartTask(handle: TaskHandle) -> CInt32;
    fn DAQmxStopTask(handle: TaskHandle) -> CInt32;
    fn DAQmxClearTask(handle: TaskHandle) -> CInt32;

    fn DAQmxWaitUntilTaskDone(handle: TaskHandle, timeToWait: CFloat64) -> CInt32;
    fn DAQmxCfgSampClkTiming(
        handle: TaskHandle,
        src: CConstStr,
        rate: CFloat64,
        activeEdge: CInt32,
        sampleMode: CInt32,
        sampsPerChan: CUint64,
    ) -> CInt32;

    fn DAQmxCreateAOVoltageChan(
        handle: TaskHandle,
        name: CConstStr,
        assigned_name: CConstStr,
        minVal: CFloat64,
        maxVal: CFloat64,
        units: CInt32,
        customScaleName: CConstStr,
    ) -> CInt32;

    fn DAQmxWriteAnalogF64(
        handle: TaskHandle,
        seqLen: CInt32,
        autoStart: CBool32,
        timeout: CFloat64,
        dataLayout: CBool32,
        writeArray: *const CFloat64,
        sampsPerChanWritten: *mut CInt32,
        reserved: *mut CBool32,
    ) -> CInt32;

    fn DAQmxCfgDigEdgeStartTrig(
        handle: TaskHandle,
        triggerSource: CConstStr,
        triggerEdge: CInt32,
    ) -> CInt32;
}

fn extended_error_info() -> String {
    let mut err_buff = [0 as libc::c_char; 2048];
    unsafe {
        DAQmxGetExtendedErrorInfo(err_buff.as_mut_ptr(), 2048 as CUint32);
    }
    unsafe { std::ffi::CStr::from_ptr(err_buff.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

/// Calls a DAQmx C-function and converts a negative status into [`DispatchError::Driver`].
///
/// # Examples
///
/// ```ignore
/// daqmx_call(|| unsafe { DAQmxSomeFunction(param1, param2) })?;
/// ```
pub fn daqmx_call<F: FnOnce() -> CInt32>(func: F) -> Result<(), DispatchError> {
    let err_code = func();
    if err_code < 0 {
        let error_string = extended_error_info();
        error!("DAQmx Error {}: {}", err_code, error_string);
        return Err(DispatchError::Driver(error_string));
    }
    Ok(())
}

fn c_string(value: &str) -> Result<CString, DispatchError> {
    CString::new(value).map_err(|e| DispatchError::Driver(format!("invalid string {:?}: {}", value, e)))
}

/// Represents a National Instruments (NI) DAQmx task.
///
/// Creating an instance corresponds to creating a new NI-DAQmx task; dropping it clears the task.
///
/// # Examples
///
/// ```ignore
/// let task = NiTask::new()?;
/// task.create_ao_chan("Dev1/ao0")?;
/// task.cfg_sample_clk(1000.0, 1000)?;
/// task.write_analog(&signal_arr, false)?;
/// task.start()?;
/// task.wait_until_done(Duration::from_secs(2))?;
/// ```
pub struct NiTask {
    handle: TaskHandle,
}

impl NiTask {
    pub fn new() -> Result<Self, DispatchError> {
        let mut taskhandle: TaskHandle = std::ptr::null_mut();
        let task_name_cstr = c_string("")?;
        daqmx_call(|| unsafe { DAQmxCreateTask(task_name_cstr.as_ptr(), &mut taskhandle) })?;
        Ok(Self { handle: taskhandle })
    }

    pub fn clear(&self) -> Result<(), DispatchError> {
        daqmx_call(|| unsafe { DAQmxClearTask(self.handle) })
    }
}

impl OutputTask for NiTask {
    fn create_ao_chan(&self, name: &str) -> Result<(), DispatchError> {
        let name_cstr = c_string(name)?;
        let assigned_name_cstr = c_string("")?;
        daqmx_call(|| unsafe {
            DAQmxCreateAOVoltageChan(
                self.handle,
                name_cstr.as_ptr(),
                assigned_name_cstr.as_ptr(),
                -10.,
                10.,
                DAQMX_VAL_VOLTS,
                std::ptr::null(),
            )
        })
    }

    fn cfg_sample_clk(&self, samp_rate: f64, seq_len: u64) -> Result<(), DispatchError> {
        // Onboard clock
        let src_cstring = c_string("")?;
        daqmx_call(|| unsafe {
            DAQmxCfgSampClkTiming(
                self.handle,
                src_cstring.as_ptr(),
                samp_rate as CFloat64,
                DAQMX_VAL_RISING,
                DAQMX_VAL_FINITESAMPS,
                seq_len as CUint64,
            )
        })
    }

    fn cfg_dig_edge_start_trigger(&self, source: &str, edge: Edge) -> Result<(), DispatchError> {
        let trigger_source_cstr = c_string(source)?;
        let edge = match edge {
            Edge::Rising => DAQMX_VAL_RISING,
            Edge::Falling => DAQMX_VAL_FALLING,
        };
        daqmx_call(|| unsafe {
            DAQmxCfgDigEdgeStartTrig(self.handle, trigger_source_cstr.as_ptr(), edge)
        })
    }

    fn write_analog(&self, signal_arr: &Array2<f64>, auto_start: bool) -> Result<usize, DispatchError> {
        // One row per channel, laid out contiguously
        let signal_arr = signal_arr.as_standard_layout();
        let mut nwritten: CInt32 = 0;
        daqmx_call(|| unsafe {
            DAQmxWriteAnalogF64(
                self.handle,
                signal_arr.ncols() as CInt32,
                auto_start as CBool32,
                10.,
                DAQMX_VAL_GROUPBYCHANNEL,
                signal_arr.as_ptr(),
                &mut nwritten as *mut CInt32,
                std::ptr::null_mut(),
            )
        })?;
        Ok(nwritten as usize)
    }

    fn start(&self) -> Result<(), DispatchError> {
        daqmx_call(|| unsafe { DAQmxStartTask(self.handle) })
    }

    fn wait_until_done(&self, timeout: Duration) -> Result<bool, DispatchError> {
        let status = unsafe { DAQmxWaitUntilTaskDone(self.handle, timeout.as_secs_f64() as CFloat64) };
        if status == DAQMX_ERROR_WAIT_TIMEOUT {
            return Ok(false);
        }
        daqmx_call(|| status)?;
        Ok(true)
    }

    fn stop(&self) -> Result<(), DispatchError> {
        daqmx_call(|| unsafe { DAQmxStopTask(self.handle) })
    }
}

// Define deletion behavior
impl Drop for NiTask {
    fn drop(&mut self) {
        // Failures are already logged by `daqmx_call`
        let _ = self.clear();
    }
}

/// Analog backend playing through the NI-DAQmx driver.
#[derive(Clone, Copy, Debug, Default)]
pub struct NiBackend;

impl AnalogBackend for NiBackend {
    fn new_task(&self) -> Result<Box<dyn OutputTask>, DispatchError> {
        Ok(Box::new(NiTask::new()?))
    }
}
