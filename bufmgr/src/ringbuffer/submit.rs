// Copyright (c) 2024 The bufmgr developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The submission descriptor, and how a ring's tables become one.
//!
//! A submission consists of a list of buffer objects and a list of commands. Each command is a
//! range of a buffer object from the list, with the relocations that fall into that range. Each
//! relocation names the buffer object whose address is patched in by its index in the list.
//!
//! When a ring is flushed, its own tables are extended with everything the rings it references
//! reference, transitively. The relocations recorded in another ring use indices into that ring's
//! own buffer table, so they are translated into indices of the flushed ring's table on the way.

use super::{
    table::{CmdEntry, CmdTarget},
    RelocFlags, RingError, RingState, Ringbuffer,
};
use crate::{
    device::{pipe::PipeId, DeviceOwned, FenceFd},
    macros::kernel_bitflags,
    NonExhaustive,
};
use bytemuck::{Pod, Zeroable};
use smallvec::SmallVec;
use std::sync::atomic::Ordering;

/// A buffer object in a submission.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Zeroable, Pod)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[repr(C)]
pub struct SubmitBo {
    /// [`RelocFlags`] bits.
    pub flags: u32,
    pub handle: u32,
    /// The address that relocations were written with.
    pub presumed: u64,
}

/// A relocation in a submission.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Zeroable, Pod)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[repr(C)]
pub struct SubmitReloc {
    /// Byte offset of the patched word within the command's buffer object.
    pub submit_offset: u32,
    pub or: u32,
    pub shift: i32,
    /// Index of the referenced buffer object in the submission.
    pub reloc_idx: u32,
    /// Byte offset within the referenced buffer object.
    pub reloc_offset: u64,
}

/// What a command is to the kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[repr(u32)]
pub enum CmdKind {
    /// Executed directly.
    Buf = 1,

    /// Only executed by jumping into it from another command.
    IbTargetBuf = 2,
}

/// A command in a submission.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SubmitCmd {
    pub kind: CmdKind,
    /// Index of the command's buffer object in the submission.
    pub submit_idx: u32,
    /// Byte offset of the command within its buffer object.
    pub submit_offset: u32,
    /// Size of the command in bytes.
    pub size: u32,
    pub relocs: Vec<SubmitReloc>,
}

kernel_bitflags! {
    /// Flags of a submission.
    SubmitFlags = u32;

    /// Wait for the fence file descriptor passed in the request before executing.
    FENCE_FD_IN = 0x4000_0000,

    /// Return a fence file descriptor that signals when the submission completes.
    FENCE_FD_OUT = 0x2000_0000,

    /// Don't synchronize with other users of the buffer objects.
    NO_IMPLICIT = 0x8000_0000,
}

/// Everything the kernel needs to execute a submission.
#[derive(Clone, Copy, Debug)]
pub struct SubmitRequest<'a> {
    pub pipe: PipeId,
    pub flags: SubmitFlags,
    pub bos: &'a [SubmitBo],
    pub cmds: &'a [SubmitCmd],
    pub fence_fd: Option<FenceFd>,
}

/// The outcome of a successful submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubmitResult {
    /// The timestamp that the pipe reaches when the submission completes.
    pub fence: u32,

    /// Present if [`FlushInfo::want_fence_fd`] was set.
    pub fence_fd: Option<FenceFd>,
}

/// Parameters to flush a ringbuffer.
#[derive(Clone, Debug)]
pub struct FlushInfo {
    /// Where the submitted range of the last segment starts. Earlier words were submitted
    /// before.
    ///
    /// The default value is `None`, which means right after the previous submission of a
    /// fixed-size ring, and the start of the segment otherwise.
    pub last_start: Option<u32>,

    /// A fence that must signal before the submission executes.
    ///
    /// The default value is `None`.
    pub fence_fd: Option<FenceFd>,

    /// Whether to return a fence file descriptor for the submission.
    ///
    /// The default value is `false`.
    pub want_fence_fd: bool,

    /// Whether to skip synchronizing with other users of the same buffer objects.
    ///
    /// The default value is `false`.
    pub no_implicit_sync: bool,

    pub _ne: NonExhaustive,
}

impl Default for FlushInfo {
    #[inline]
    fn default() -> Self {
        Self {
            last_start: None,
            fence_fd: None,
            want_fence_fd: false,
            no_implicit_sync: false,
            _ne: NonExhaustive(()),
        }
    }
}

/// Assembles the submission of a ring from its tables.
///
/// The tables are extended along the way but otherwise left as they are, whether the kernel
/// accepts the submission or not.
pub(crate) struct SubmissionBuilder<'a> {
    ring: &'a Ringbuffer,
    state: &'a mut RingState,
}

impl<'a> SubmissionBuilder<'a> {
    pub(crate) fn new(ring: &'a Ringbuffer, state: &'a mut RingState) -> Self {
        SubmissionBuilder { ring, state }
    }

    /// Builds the descriptor and hands it to the kernel. On success, the fence is stamped on the
    /// ring and on every ring it references.
    pub(crate) fn submit(mut self, flush_info: FlushInfo) -> Result<SubmitResult, RingError> {
        let FlushInfo {
            last_start,
            fence_fd,
            want_fence_fd,
            no_implicit_sync,
            _ne: _,
        } = flush_info;

        let last_start = last_start.unwrap_or(self.state.flushed_to);
        self.finalize_current(last_start);

        let cmds = self.collect_cmds();
        let bos: Vec<_> = self
            .state
            .bos
            .entries()
            .iter()
            .map(|entry| SubmitBo {
                flags: entry.flags.bits(),
                handle: entry.bo.handle().0,
                presumed: entry.bo.iova(),
            })
            .collect();

        let mut flags = SubmitFlags::empty();

        if fence_fd.is_some() {
            flags |= SubmitFlags::FENCE_FD_IN;
        }

        if want_fence_fd {
            flags |= SubmitFlags::FENCE_FD_OUT;
        }

        if no_implicit_sync {
            flags |= SubmitFlags::NO_IMPLICIT;
        }

        let request = SubmitRequest {
            pipe: self.ring.pipe.id(),
            flags,
            bos: &bos,
            cmds: &cmds,
            fence_fd,
        };

        let result = match self.ring.device().kernel().submit(&request) {
            Ok(result) => result,
            Err(err) => {
                log::error!("submission on {:?} failed: {}", request.pipe, err);
                dump(&request, log::Level::Error);

                return Err(RingError::SubmissionRejected(err));
            }
        };

        log::debug!(
            "submitted {} commands and {} buffer objects on {:?}, fence {}",
            cmds.len(),
            bos.len(),
            request.pipe,
            result.fence,
        );

        if log::log_enabled!(log::Level::Trace) {
            dump(&request, log::Level::Trace);
        }

        self.ring
            .last_timestamp
            .store(result.fence, Ordering::Release);

        for cmd in self.state.cmds.entries() {
            if let CmdTarget::Ring(target) = &cmd.target {
                target.last_timestamp.store(result.fence, Ordering::Release);
            }
        }

        Ok(result)
    }

    // Registers the unsubmitted part of the last segment as a command.
    fn finalize_current(&mut self, last_start: u32) {
        let Some(index) = self.state.segments.len().checked_sub(1) else {
            return;
        };

        let segment = &mut self.state.segments[index];
        assert!(
            last_start <= segment.len(),
            "last_start is past the end of the recorded commands",
        );

        segment.finalize();

        let size = segment.len() - last_start;

        if size != 0 {
            let cmd = CmdEntry::new(
                CmdTarget::Own,
                index,
                segment,
                segment.offset() + last_start,
                size,
            );
            self.state.cmds.register(cmd);
        }
    }

    // Walks the command table, which grows while it's walked as the references of referenced
    // rings are merged in. Each segment is registered at most once, so the walk ends even with
    // cycles.
    fn collect_cmds(&mut self) -> Vec<SubmitCmd> {
        let mut cmds = Vec::with_capacity(self.state.cmds.len());
        let mut index = 0;

        while index < self.state.cmds.len() {
            let cmd = self.state.cmds.get(index).clone();
            index += 1;

            let submit_cmd = match &cmd.target {
                CmdTarget::Ring(target) if target.id != self.ring.id => {
                    self.import_foreign(target, &cmd)
                }
                // Either one of the ring's own segments, or a reference back to the ring being
                // flushed. Its relocations already use the ring's own indices.
                target => {
                    let kind = match target {
                        CmdTarget::Own => CmdKind::Buf,
                        CmdTarget::Ring(_) => CmdKind::IbTargetBuf,
                    };
                    let RingState { segments, bos, .. } = &mut *self.state;
                    let segment = &segments[cmd.segment_index];

                    SubmitCmd {
                        kind,
                        submit_idx: bos.add(segment.bo(), RelocFlags::READ),
                        submit_offset: cmd.submit_offset,
                        size: cmd.size,
                        relocs: segment
                            .relocations()
                            .iter()
                            .map(|reloc| SubmitReloc {
                                submit_offset: reloc.submit_offset,
                                or: reloc.or,
                                shift: reloc.shift,
                                reloc_idx: reloc.bo_index,
                                reloc_offset: u64::from(reloc.offset),
                            })
                            .collect(),
                    }
                }
            };

            cmds.push(submit_cmd);
        }

        cmds
    }

    // Translates a segment of another ring into the flushed ring's tables, and queues the rings
    // that one references in turn. The other ring is only locked for the duration.
    fn import_foreign(&mut self, target: &Ringbuffer, cmd: &CmdEntry) -> SubmitCmd {
        let mut nested = SmallVec::<[CmdEntry; 4]>::new();
        let target_state = target.state.lock();
        let segment = target_state
            .segments
            .get(cmd.segment_index)
            .filter(|segment| segment.id() == cmd.segment_id)
            .expect("a referenced ringbuffer was reset before the submission");

        let bos = &mut self.state.bos;
        let submit_idx = bos.add(segment.bo(), RelocFlags::READ);
        let relocs = segment
            .relocations()
            .iter()
            .map(|reloc| {
                let entry = target_state.bos.get(reloc.bo_index);

                SubmitReloc {
                    submit_offset: reloc.submit_offset,
                    or: reloc.or,
                    shift: reloc.shift,
                    reloc_idx: bos.add(&entry.bo, entry.flags),
                    reloc_offset: u64::from(reloc.offset),
                }
            })
            .collect();

        nested.extend(
            target_state
                .cmds
                .entries()
                .iter()
                .filter(|nested| matches!(nested.target, CmdTarget::Ring(_)))
                .cloned(),
        );
        drop(target_state);

        for nested in nested {
            self.state.cmds.register(nested);
        }

        SubmitCmd {
            kind: CmdKind::IbTargetBuf,
            submit_idx,
            submit_offset: cmd.submit_offset,
            size: cmd.size,
            relocs,
        }
    }
}

fn dump(request: &SubmitRequest<'_>, level: log::Level) {
    for (index, bo) in request.bos.iter().enumerate() {
        log::log!(
            level,
            "  bo[{}]: handle {}, flags {:?}, presumed {:#x}",
            index,
            bo.handle,
            RelocFlags::from_bits_truncate(bo.flags),
            bo.presumed,
        );
    }

    for (index, cmd) in request.cmds.iter().enumerate() {
        log::log!(
            level,
            "  cmd[{}]: {:?} bo[{}] {:#x}+{:#x}, {} relocations",
            index,
            cmd.kind,
            cmd.submit_idx,
            cmd.submit_offset,
            cmd.size,
            cmd.relocs.len(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::BoFlags,
        ringbuffer::{Reloc, RingbufferCreateInfo, RingbufferFlags},
        KernelError,
    };
    use std::sync::Arc;

    fn growable(pipe: &Arc<crate::Pipe>) -> Arc<Ringbuffer> {
        Ringbuffer::new(
            pipe.clone(),
            RingbufferCreateInfo {
                flags: RingbufferFlags::GROWABLE,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn descriptor() {
        let (device, pipe, kernel) = mock_pipe!();
        let ring = growable(&pipe);
        let x = device.allocate_bo(4096, BoFlags::empty()).unwrap();

        ring.emit_words(&[1, 2]).unwrap();
        ring.append_relocation(&Reloc::new(&x, RelocFlags::READ))
            .unwrap();
        ring.append_relocation(&Reloc {
            offset: 0x10,
            ..Reloc::new(&x, RelocFlags::WRITE)
        })
        .unwrap();

        let result = ring.flush(FlushInfo::default()).unwrap();
        assert_eq!(result.fence_fd, None);

        let submits = kernel.submits();
        assert_eq!(submits.len(), 1);
        let submit = &submits[0];

        assert_eq!(submit.pipe, pipe.id());
        assert_eq!(submit.flags, SubmitFlags::empty());
        assert_eq!(submit.bos.len(), 2);
        assert_eq!(submit.bos[0].handle, x.handle().0);
        assert_eq!(
            submit.bos[0].flags,
            (RelocFlags::READ | RelocFlags::WRITE).bits(),
        );
        assert_eq!(submit.bos[1].flags, RelocFlags::READ.bits());

        assert_eq!(submit.cmds.len(), 1);
        let cmd = &submit.cmds[0];
        assert_eq!(cmd.kind, CmdKind::Buf);
        assert_eq!(cmd.submit_idx, 1);
        assert_eq!((cmd.submit_offset, cmd.size), (0, 16));
        assert_eq!(cmd.relocs.len(), 2);
        assert_eq!(cmd.relocs[0].reloc_idx, 0);
        assert_eq!(cmd.relocs[1].submit_offset, 12);
        assert_eq!(cmd.relocs[1].reloc_offset, 0x10);

        assert_eq!(ring.last_timestamp(), result.fence);
    }

    #[test]
    fn flush_resets() {
        let (device, pipe, kernel) = mock_pipe!();
        let ring = growable(&pipe);
        let x = device.allocate_bo(4096, BoFlags::empty()).unwrap();
        let y = device.allocate_bo(4096, BoFlags::empty()).unwrap();

        ring.append_relocation(&Reloc::new(&x, RelocFlags::READ))
            .unwrap();
        ring.flush(FlushInfo::default()).unwrap();

        assert_eq!(ring.bo_count(), 0);
        assert_eq!(ring.segment_count(), 1);
        assert_eq!(ring.segment_size(0), 0);
        assert_eq!(x.refcount(), 1);

        ring.append_relocation(&Reloc::new(&y, RelocFlags::READ))
            .unwrap();
        assert_eq!(ring.bo_count(), 1);
        ring.flush(FlushInfo::default()).unwrap();

        let submits = kernel.submits();
        let handles: Vec<_> = submits[1].bos.iter().map(|bo| bo.handle).collect();
        assert!(handles.contains(&y.handle().0));
        assert!(!handles.contains(&x.handle().0));
    }

    #[test]
    fn chained_segments_are_submitted() {
        let (_device, pipe, kernel) = mock_pipe!();
        let ring = growable(&pipe);

        ring.emit_words(&[0; 1024]).unwrap();
        ring.emit(0).unwrap();
        ring.flush(FlushInfo::default()).unwrap();

        let submit = &kernel.submits()[0];
        assert_eq!(submit.cmds.len(), 2);
        assert!(submit.cmds.iter().all(|cmd| cmd.kind == CmdKind::Buf));
        assert_eq!(submit.cmds[0].size, 0x1000);
        assert_eq!(submit.cmds[1].size, 4);
        assert_ne!(submit.cmds[0].submit_idx, submit.cmds[1].submit_idx);
    }

    #[test]
    fn references_are_followed_transitively() {
        let (device, pipe, kernel) = mock_pipe!();
        let x = device.allocate_bo(4096, BoFlags::empty()).unwrap();

        let t = Ringbuffer::new_object(pipe.clone(), 0x100).unwrap();
        t.emit(0xdead).unwrap();
        t.append_relocation(&Reloc::new(&x, RelocFlags::WRITE))
            .unwrap();

        let s = Ringbuffer::new_object(pipe.clone(), 0x100).unwrap();
        let t_size = s.append_ring_reference(&t, 0).unwrap();
        assert_eq!(t_size, 8);

        let r = growable(&pipe);
        r.append_ring_reference(&s, 0).unwrap();
        r.append_ring_reference(&s, 0).unwrap();
        r.flush(FlushInfo::default()).unwrap();

        let submit = &kernel.submits()[0];
        assert_eq!(submit.cmds.len(), 3);

        let kinds: Vec<_> = submit.cmds.iter().map(|cmd| cmd.kind).collect();
        assert_eq!(
            kinds,
            [CmdKind::IbTargetBuf, CmdKind::Buf, CmdKind::IbTargetBuf],
        );

        // Every buffer shows up exactly once.
        let mut handles: Vec<_> = submit.bos.iter().map(|bo| bo.handle).collect();
        handles.sort_unstable();
        handles.dedup();
        assert_eq!(handles.len(), submit.bos.len());
        assert_eq!(submit.bos.len(), 4);

        // T's relocation was translated into R's table.
        let t_cmd = &submit.cmds[2];
        assert_eq!(t_cmd.size, 8);
        assert_eq!(t_cmd.relocs.len(), 1);
        let target = &submit.bos[t_cmd.relocs[0].reloc_idx as usize];
        assert_eq!(target.handle, x.handle().0);
        assert_eq!(target.flags, RelocFlags::WRITE.bits());

        assert_eq!(r.last_timestamp(), 1);
        assert_eq!(s.last_timestamp(), 1);
        assert_eq!(t.last_timestamp(), 1);

        // R no longer holds S.
        assert_eq!(Arc::strong_count(&s), 1);
    }

    #[test]
    fn rejected_submission_keeps_state() {
        let (device, pipe, kernel) = mock_pipe!();
        let ring = growable(&pipe);
        let x = device.allocate_bo(4096, BoFlags::empty()).unwrap();

        ring.emit(1).unwrap();
        ring.append_relocation(&Reloc::new(&x, RelocFlags::READ))
            .unwrap();

        kernel.fail_next_submit(KernelError::EINVAL);
        assert_eq!(
            ring.flush(FlushInfo::default()),
            Err(RingError::SubmissionRejected(KernelError::EINVAL)),
        );
        assert_eq!(ring.last_timestamp(), 0);
        assert_eq!(ring.bo_count(), 2);
        assert_eq!(ring.relocations(0).len(), 1);

        // Retrying submits the same thing once more.
        ring.flush(FlushInfo::default()).unwrap();
        let submits = kernel.submits();
        assert_eq!(submits.len(), 1);
        assert_eq!(submits[0].cmds.len(), 1);
        assert_eq!(submits[0].cmds[0].size, 8);
        assert_eq!(ring.bo_count(), 0);
    }

    #[test]
    fn rejected_submission_then_reset() {
        let (device, pipe, kernel) = mock_pipe!();
        let ring = growable(&pipe);
        let x = device.allocate_bo(4096, BoFlags::empty()).unwrap();

        ring.append_relocation(&Reloc::new(&x, RelocFlags::READ))
            .unwrap();
        kernel.fail_next_submit(KernelError::ENOMEM);
        assert!(ring.flush(FlushInfo::default()).is_err());

        ring.reset();
        assert_eq!(ring.bo_count(), 0);
        assert_eq!(x.refcount(), 1);
    }

    #[test]
    fn fixed_rings_submit_from_last_start() {
        let (_device, pipe, kernel) = mock_pipe!();
        let ring = Ringbuffer::new(pipe.clone(), RingbufferCreateInfo::default()).unwrap();

        ring.emit_words(&[1, 2, 3]).unwrap();
        ring.flush(FlushInfo::default()).unwrap();
        ring.emit_words(&[4, 5]).unwrap();
        ring.flush(FlushInfo::default()).unwrap();

        let submits = kernel.submits();
        assert_eq!(
            (submits[0].cmds[0].submit_offset, submits[0].cmds[0].size),
            (0, 12),
        );
        assert_eq!(
            (submits[1].cmds[0].submit_offset, submits[1].cmds[0].size),
            (12, 8),
        );
        assert_eq!(ring.segment_words(0), [1, 2, 3, 4, 5]);

        ring.reset();
        ring.emit(6).unwrap();
        ring.flush(FlushInfo {
            last_start: Some(0),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(kernel.submits()[2].cmds[0].submit_offset, 0);

        assert_should_panic!("last_start is past the end", {
            let _ = ring.flush(FlushInfo {
                last_start: Some(64),
                ..Default::default()
            });
        });
        assert_eq!(kernel.submits().len(), 3);
    }

    #[test]
    fn fence_fds() {
        let (_device, pipe, kernel) = mock_pipe!();
        let ring = growable(&pipe);

        ring.emit(0).unwrap();
        let result = ring
            .flush(FlushInfo {
                fence_fd: Some(FenceFd(3)),
                want_fence_fd: true,
                no_implicit_sync: true,
                ..Default::default()
            })
            .unwrap();
        assert!(result.fence_fd.is_some());

        let submit = &kernel.submits()[0];
        assert_eq!(
            submit.flags,
            SubmitFlags::FENCE_FD_IN | SubmitFlags::FENCE_FD_OUT | SubmitFlags::NO_IMPLICIT,
        );
        assert_eq!(submit.fence_fd, Some(FenceFd(3)));
    }

    #[test]
    fn objects_cant_be_flushed() {
        let (_device, pipe, _kernel) = mock_pipe!();
        let object = Ringbuffer::new_object(pipe, 0x100).unwrap();

        assert_should_panic!("state objects can't be flushed", {
            let _ = object.flush(FlushInfo::default());
        });
    }

    #[test]
    fn descriptor_layout() {
        assert_eq!(std::mem::size_of::<SubmitBo>(), 16);
        assert_eq!(std::mem::size_of::<SubmitReloc>(), 24);

        let bo = SubmitBo {
            flags: 1,
            handle: 2,
            presumed: 3,
        };
        let bytes: &[u8] = bytemuck::bytes_of(&bo);
        assert_eq!(&bytes[4..8], 2u32.to_ne_bytes());
    }
}
