// Copyright (c) 2024 The bufmgr developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

#![cfg(test)]

use crate::{
    device::{
        pipe::{PipeId, Timeout, WaitStatus},
        AccessFlags, BoFlags, BoHandle, FenceFd, KernelDevice, Madvise,
    },
    ringbuffer::submit::{SubmitBo, SubmitCmd, SubmitFlags, SubmitRequest, SubmitResult},
    KernelError,
};
use foldhash::{HashMap, HashSet};
use parking_lot::Mutex;
use std::{ptr::NonNull, sync::Arc};

/// Creates a device on top of a fresh [`MockKernel`]. Returns both.
macro_rules! mock_device {
    () => {
        mock_device!($crate::device::DeviceCreateInfo::default())
    };
    ($create_info:expr) => {{
        let kernel = $crate::tests::MockKernel::new();
        let device = $crate::device::Device::new(kernel.clone(), $create_info);

        (device, kernel)
    }};
}

/// Creates a device and a pipe on it, optionally with a GPU id. Returns the device, the pipe and
/// the kernel.
macro_rules! mock_pipe {
    () => {
        mock_pipe!(0)
    };
    ($gpu_id:expr) => {{
        let (device, kernel) = mock_device!();
        let pipe = $crate::device::pipe::Pipe::new(
            device.clone(),
            $crate::device::pipe::PipeCreateInfo {
                gpu_id: $gpu_id,
                ..Default::default()
            },
        );

        (device, pipe, kernel)
    }};
}

macro_rules! assert_should_panic {
    ($msg:expr, $code:block) => {{
        let res = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| $code));

        match res {
            Ok(_) => panic!("Test expected to panic but didn't"),
            Err(err) => {
                if let Some(msg) = err.downcast_ref::<String>() {
                    assert!(msg.contains($msg), "unexpected panic message: {}", msg);
                } else if let Some(&msg) = err.downcast_ref::<&str>() {
                    assert!(msg.contains($msg), "unexpected panic message: {}", msg);
                } else {
                    panic!("Couldn't decipher the panic message of the test")
                }
            }
        }
    }};
}

/// A submission the mock kernel accepted.
#[derive(Clone, Debug)]
pub(crate) struct RecordedSubmit {
    pub(crate) pipe: PipeId,
    pub(crate) flags: SubmitFlags,
    pub(crate) bos: Vec<SubmitBo>,
    pub(crate) cmds: Vec<SubmitCmd>,
    pub(crate) fence_fd: Option<FenceFd>,
}

/// An in-memory stand-in for the kernel driver.
#[derive(Debug, Default)]
pub(crate) struct MockKernel {
    state: Mutex<MockState>,
}

#[derive(Debug, Default)]
struct MockState {
    last_handle: u32,
    bos: HashMap<BoHandle, MockBo>,
    closed: HashSet<BoHandle>,
    // Global name to size, and to the handle it's currently open under.
    exported: HashMap<u32, u32>,
    opened: HashMap<u32, BoHandle>,
    allocations: usize,
    maps: usize,
    fail_allocation: Option<KernelError>,
    fail_map: Option<KernelError>,
    fail_submit: Option<KernelError>,
    last_fence: u32,
    completed_fence: u32,
    submits: Vec<RecordedSubmit>,
}

#[derive(Debug)]
struct MockBo {
    size: u32,
    // Allocated on first map, so that huge buffers cost nothing.
    memory: Option<Box<[u32]>>,
    busy: bool,
    purgeable: bool,
    purged: bool,
}

impl MockKernel {
    pub(crate) fn new() -> Arc<MockKernel> {
        Arc::new(MockKernel::default())
    }

    fn new_handle(state: &mut MockState, size: u32) -> BoHandle {
        state.last_handle += 1;
        let handle = BoHandle(state.last_handle);
        state.bos.insert(
            handle,
            MockBo {
                size,
                memory: None,
                busy: false,
                purgeable: false,
                purged: false,
            },
        );

        handle
    }

    pub(crate) fn allocation_count(&self) -> usize {
        self.state.lock().allocations
    }

    pub(crate) fn map_count(&self) -> usize {
        self.state.lock().maps
    }

    pub(crate) fn is_closed(&self, handle: BoHandle) -> bool {
        self.state.lock().closed.contains(&handle)
    }

    pub(crate) fn set_busy(&self, handle: BoHandle, busy: bool) {
        if let Some(bo) = self.state.lock().bos.get_mut(&handle) {
            bo.busy = busy;
        }
    }

    /// Drops the pages of a purgeable buffer, like the kernel does under memory pressure.
    pub(crate) fn purge(&self, handle: BoHandle) {
        if let Some(bo) = self.state.lock().bos.get_mut(&handle) {
            assert!(bo.purgeable);
            bo.purged = true;
        }
    }

    pub(crate) fn export_name(&self, name: u32, size: u32) {
        self.state.lock().exported.insert(name, size);
    }

    pub(crate) fn fail_next_allocation(&self, err: KernelError) {
        self.state.lock().fail_allocation = Some(err);
    }

    pub(crate) fn fail_next_map(&self, err: KernelError) {
        self.state.lock().fail_map = Some(err);
    }

    pub(crate) fn fail_next_submit(&self, err: KernelError) {
        self.state.lock().fail_submit = Some(err);
    }

    pub(crate) fn set_completed_fence(&self, fence: u32) {
        self.state.lock().completed_fence = fence;
    }

    pub(crate) fn submits(&self) -> Vec<RecordedSubmit> {
        self.state.lock().submits.clone()
    }
}

unsafe impl KernelDevice for MockKernel {
    fn allocate_bo(&self, size: u32, _flags: BoFlags) -> Result<BoHandle, KernelError> {
        let mut state = self.state.lock();

        if let Some(err) = state.fail_allocation.take() {
            return Err(err);
        }

        state.allocations += 1;

        Ok(Self::new_handle(&mut state, size))
    }

    fn open_bo(&self, name: u32) -> Result<(BoHandle, u32), KernelError> {
        let mut state = self.state.lock();
        let size = *state.exported.get(&name).ok_or(KernelError::ENOENT)?;

        if let Some(&handle) = state.opened.get(&name) {
            if state.bos.contains_key(&handle) {
                return Ok((handle, size));
            }
        }

        let handle = Self::new_handle(&mut state, size);
        state.opened.insert(name, handle);

        Ok((handle, size))
    }

    fn close_bo(&self, handle: BoHandle) {
        let mut state = self.state.lock();
        assert!(state.bos.remove(&handle).is_some(), "double close");
        state.closed.insert(handle);
    }

    fn iova(&self, handle: BoHandle) -> u64 {
        0x1_0000_0000 + (u64::from(handle.0) << 24)
    }

    fn map(&self, handle: BoHandle, _size: u32) -> Result<NonNull<u8>, KernelError> {
        let mut state = self.state.lock();

        if let Some(err) = state.fail_map.take() {
            return Err(err);
        }

        state.maps += 1;
        let bo = state.bos.get_mut(&handle).ok_or(KernelError::ENOENT)?;
        let words = (bo.size as usize).div_ceil(4);
        let memory = bo
            .memory
            .get_or_insert_with(|| vec![0; words].into_boxed_slice());

        Ok(NonNull::from(&mut memory[..]).cast())
    }

    unsafe fn unmap(&self, _handle: BoHandle, _ptr: NonNull<u8>, _size: u32) {}

    fn query_busy(&self, handle: BoHandle, _access: AccessFlags) -> bool {
        self.state.lock().bos.get(&handle).is_some_and(|bo| bo.busy)
    }

    fn madvise(&self, handle: BoHandle, advice: Madvise) -> Result<bool, KernelError> {
        let mut state = self.state.lock();
        let bo = state.bos.get_mut(&handle).ok_or(KernelError::ENOENT)?;

        match advice {
            Madvise::DontNeed => {
                bo.purgeable = true;

                Ok(true)
            }
            Madvise::WillNeed => {
                bo.purgeable = false;

                Ok(!bo.purged)
            }
        }
    }

    fn submit(&self, request: &SubmitRequest<'_>) -> Result<SubmitResult, KernelError> {
        let mut state = self.state.lock();

        if let Some(err) = state.fail_submit.take() {
            return Err(err);
        }

        for bo in request.bos {
            if !state.bos.contains_key(&BoHandle(bo.handle)) {
                return Err(KernelError::EINVAL);
            }
        }

        for cmd in request.cmds {
            if cmd.submit_idx as usize >= request.bos.len()
                || cmd
                    .relocs
                    .iter()
                    .any(|reloc| reloc.reloc_idx as usize >= request.bos.len())
            {
                return Err(KernelError::EINVAL);
            }
        }

        state.last_fence += 1;
        let fence = state.last_fence;

        state.submits.push(RecordedSubmit {
            pipe: request.pipe,
            flags: request.flags,
            bos: request.bos.to_vec(),
            cmds: request.cmds.to_vec(),
            fence_fd: request.fence_fd,
        });

        let fence_fd = request
            .flags
            .contains(SubmitFlags::FENCE_FD_OUT)
            .then_some(FenceFd(100 + fence as i32));

        Ok(SubmitResult { fence, fence_fd })
    }

    fn wait(
        &self,
        _pipe: PipeId,
        timestamp: u32,
        timeout: Timeout,
    ) -> Result<WaitStatus, KernelError> {
        let mut state = self.state.lock();

        if timestamp <= state.completed_fence {
            return Ok(WaitStatus::Complete);
        }

        match timeout {
            Timeout::Infinite => {
                state.completed_fence = timestamp;

                Ok(WaitStatus::Complete)
            }
            Timeout::NonBlocking | Timeout::Duration(_) => Ok(WaitStatus::TimedOut),
        }
    }
}
