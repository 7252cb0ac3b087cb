use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Entry file every task archive must provide.
pub const PYTHON_JOB_FILE_NAME: &str = "job.py";

/// Virtualenv directory created inside each task's build directory.
pub const VENV_DIR_NAME: &str = ".env";

/// Libraries installed into every Python task environment.
pub const DEFAULT_PYTHON_LIBS: &[&str] = &["elasticsearch6", "requests"];

/// Handler variant selector. A closed set: adding a task type means adding a
/// handler implementation and a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Python,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Python => "python",
        }
    }
}

/// Library profile for a task subtype. Unknown subtypes fall back to the
/// baseline set.
pub fn subtype_libs(subtype: &str) -> Vec<&'static str> {
    let extra: &[&str] = match subtype {
        "energy_plus" => &["eppy", "requests"],
        "numpy" => &["numpy", "dtw"],
        "pandas" => &["pandas"],
        _ => &[],
    };
    let mut libs = DEFAULT_PYTHON_LIBS.to_vec();
    libs.extend_from_slice(extra);
    libs
}

/// On-disk build directory for a task.
pub fn task_dir(build_dir: &Path, task_id: i64) -> PathBuf {
    build_dir.join(task_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_subtype_gets_baseline_libs() {
        assert_eq!(subtype_libs(""), DEFAULT_PYTHON_LIBS.to_vec());
        assert_eq!(subtype_libs("no_such_profile"), DEFAULT_PYTHON_LIBS.to_vec());
    }

    #[test]
    fn profiles_extend_the_baseline() {
        let libs = subtype_libs("pandas");
        for lib in DEFAULT_PYTHON_LIBS {
            assert!(libs.contains(lib));
        }
        assert!(libs.contains(&"pandas"));
    }
}
