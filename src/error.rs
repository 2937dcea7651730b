use thiserror::Error;

#[derive(Error, Debug)]
pub enum TftpError {
    #[error("{0}")]
    Tftp(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, TftpError>;

/// sysexits.h-style exit codes used only at the bootstrap boundary; the
/// reactor itself never produces a process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Ok = 0,
    Usage = 64,
    Software = 70,
    Os = 71,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Usage,
    Software,
    Os,
}

impl FailureKind {
    pub fn exit_code(self) -> ExitCode {
        match self {
            FailureKind::Usage => ExitCode::Usage,
            FailureKind::Software => ExitCode::Software,
            FailureKind::Os => ExitCode::Os,
        }
    }
}
