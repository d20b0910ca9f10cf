//! Kernel error codes.
//!
//! Fallible kernel internals return `Result<T, KernelError>` and propagate
//! with `?`; the syscall layer turns the error into a negative errno word
//! before returning to user space. Errors never cross the kernel/user
//! boundary any other way.

pub type Result<T> = core::result::Result<T, KernelError>;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(i32)]
pub enum KernelError {
    /// Operation not permitted.
    Perm = 1,
    /// No such file or directory.
    NoEnt = 2,
    /// No such process.
    Srch = 3,
    /// No child processes.
    Child = 10,
    /// Interrupted system call.
    Intr = 4,
    /// Bad file descriptor.
    BadFd = 9,
    /// Out of memory.
    NoMem = 12,
    /// Bad address.
    Fault = 14,
    /// File exists.
    Exist = 17,
    /// Cross-device link.
    XDev = 18,
    /// No such device.
    NoDev = 19,
    /// Not a directory.
    NotDir = 20,
    /// Is a directory.
    IsDir = 21,
    /// Invalid argument.
    Inval = 22,
    /// Too many open files.
    MFile = 24,
    /// File too large.
    FBig = 27,
    /// Broken pipe.
    Pipe = 32,
    /// Math argument out of domain.
    Dom = 33,
    /// Too many links.
    MLink = 31,
    /// File name too long.
    NameTooLong = 36,
    /// Directory not empty.
    NotEmpty = 39,
    /// Function not implemented.
    NoSys = 38,
    /// Resource temporarily unavailable.
    Again = 11,
}

impl KernelError {
    /// The word returned to user space: `-errno`.
    pub fn to_errno(self) -> isize {
        -(self as i32 as isize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_words_are_negative() {
        assert_eq!(KernelError::Perm.to_errno(), -1);
        assert_eq!(KernelError::NoEnt.to_errno(), -2);
        assert_eq!(KernelError::Fault.to_errno(), -14);
        assert_eq!(KernelError::Inval.to_errno(), -22);
        assert_eq!(KernelError::MLink.to_errno(), -31);
        assert_eq!(KernelError::XDev.to_errno(), -18);
    }
}
