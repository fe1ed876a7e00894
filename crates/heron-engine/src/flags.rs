//! Flag sets shared across the execution core.

bitflags::bitflags! {
    /// Per-context engine state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EngineFlags: u32 {
        /// Evaluation was entered from outside the engine (host callback, event, bgerror)
        const EXTERNAL_EXECUTION = 0b0000_0001;
        /// Always perform native stack checks
        const FORCE_STACK_CHECK  = 0b0000_0010;
        /// Skip native stack checks
        const NO_STACK_CHECK     = 0b0000_0100;

        const STACK_CHECK_MASK = Self::FORCE_STACK_CHECK.bits() | Self::NO_STACK_CHECK.bits();
    }
}

bitflags::bitflags! {
    /// Options for cancellation requests and resets.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CancelFlags: u32 {
        /// Unwind through catch handlers as well
        const UNWIND         = 0b0000_0001;
        /// Keep the supplied result as the cancellation result
        const NEED_RESULT    = 0b0000_0010;
        /// Reset also clears the halt state
        const HALT           = 0b0000_0100;
        /// Applies to the interpreter-wide cancel flag
        const GLOBAL         = 0b0000_1000;
        /// Issued by the background error dispatcher
        const BACKGROUND_ERROR = 0b0001_0000;

        const EVALUATE = Self::UNWIND.bits() | Self::NEED_RESULT.bits();
    }
}

bitflags::bitflags! {
    /// Interpreter-wide policy bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct InterpreterFlags: u32 {
        /// Reset cancellation state before running the background error handler
        const BG_ERROR_RESET_CANCEL   = 0b0000_0001;
        /// Do not report background error handler failures
        const IGNORE_BG_ERROR_FAILURE = 0b0000_0010;
    }
}

bitflags::bitflags! {
    /// Variable access and state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct VariableFlags: u32 {
        /// Concatenate the new value onto the old one
        const APPEND_VALUE   = 0b0000_0001;
        /// Append the new value as a list element
        const APPEND_ELEMENT = 0b0000_0010;
        /// Resolve the name in the global frame
        const GLOBAL_ONLY    = 0b0000_0100;
        /// Storage is partitioned per thread
        const THREAD         = 0b0000_1000;
        /// Value changed since it was last observed
        const DIRTY          = 0b0001_0000;
        /// Declared but holds no value
        const UNDEFINED      = 0b0010_0000;
    }
}

bitflags::bitflags! {
    /// Call frame kind and capability bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CallFrameFlags: u32 {
        const GLOBAL           = 0b0000_0001;
        const PROCEDURE        = 0b0000_0010;
        /// Scope frames may be left behind by callers and are popped in bulk
        const SCOPE            = 0b0000_0100;
        const NAMESPACE        = 0b0000_1000;
        const BACKGROUND_ERROR = 0b0001_0000;
        const TRACKING         = 0b0010_0000;
        /// Frame cannot hold variables
        const NO_VARIABLES     = 0b0100_0000;
    }
}

bitflags::bitflags! {
    /// Policy bits for a cooperative wait.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WaitFlags: u32 {
        /// Bound each readiness check by the ready duration
        const TIMEOUT          = 0b0000_0001;
        /// Do not pump host messages while waiting
        const STRICT           = 0b0000_0010;
        /// Ignore local cancellation and halt
        const NO_CANCEL        = 0b0000_0100;
        /// Ignore the interpreter-wide cancel flag
        const NO_GLOBAL_CANCEL = 0b0000_1000;
    }
}
