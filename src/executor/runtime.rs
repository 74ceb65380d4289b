//! Worker runtimes: the interpreter plus the driver script it runs.
//!
//! A driver never embeds the generated source. It reads the source file named
//! by `CADFORGE_SOURCE`, runs it, checks the result binding explicitly and
//! exports through the runtime's own toolkit, speaking the stdout protocol in
//! [`super::protocol`].

use super::protocol::{EXPORT_FAILED_MARKER, MISSING_RESULT_EXIT, RESULT_MISSING_MARKER, RESULT_OK_MARKER};

/// How a freshly spawned worker process is set up.
pub trait WorkerRuntime: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Program that runs the driver script.
    fn program(&self) -> &str;

    /// File extension for the generated source fragment.
    fn source_extension(&self) -> &'static str;

    /// File extension for the driver script.
    fn driver_extension(&self) -> &'static str;

    /// Driver script text for the given result binding.
    fn render_driver(&self, binding: &str) -> String;
}

const BINDING_PLACEHOLDER: &str = "__CADFORGE_BINDING__";

fn fill_markers(template: &str, binding: &str) -> String {
    template
        .replace(BINDING_PLACEHOLDER, binding)
        .replace("__RESULT_OK__", RESULT_OK_MARKER)
        .replace("__RESULT_MISSING__", RESULT_MISSING_MARKER)
        .replace("__EXPORT_FAILED__", EXPORT_FAILED_MARKER)
        .replace("__MISSING_EXIT__", &MISSING_RESULT_EXIT.to_string())
}

const CADQUERY_DRIVER: &str = r#"import os
import sys
import traceback

SOURCE = os.environ["CADFORGE_SOURCE"]
OUTPUT_DIR = os.environ["CADFORGE_OUTPUT_DIR"]
UNIT_ID = os.environ["CADFORGE_UNIT_ID"]
FORMATS = [f for f in os.environ.get("CADFORGE_FORMATS", "").split(",") if f]
BINDING = "__CADFORGE_BINDING__"
EXPORT_TYPES = {"step": "STEP", "stl": "STL", "dxf": "DXF"}


def main():
    import cadquery as cq

    namespace = {"__name__": "__cadforge__", "cq": cq}
    with open(SOURCE, "r", encoding="utf-8") as fh:
        code = fh.read()
    try:
        exec(compile(code, SOURCE, "exec"), namespace)
    except SystemExit:
        traceback.print_exc()
        return 1

    if namespace.get(BINDING) is None:
        print("__RESULT_MISSING__ " + BINDING, flush=True)
        return __MISSING_EXIT__

    result = namespace[BINDING]
    print("__RESULT_OK__", flush=True)
    for fmt in FORMATS:
        path = os.path.join(OUTPUT_DIR, UNIT_ID + "." + fmt)
        try:
            cq.exporters.export(result, path, exportType=EXPORT_TYPES[fmt])
            print(fmt + ":" + path, flush=True)
        except Exception as exc:
            message = str(exc).replace("\n", " ") or type(exc).__name__
            print("__EXPORT_FAILED__ " + fmt + ": " + message, flush=True)
    return 0


if __name__ == "__main__":
    sys.exit(main())
"#;

/// Python worker that exports through CadQuery.
#[derive(Debug, Clone)]
pub struct CadQueryRuntime {
    interpreter: String,
}

impl CadQueryRuntime {
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }
}

impl Default for CadQueryRuntime {
    fn default() -> Self {
        Self::new("python3")
    }
}

impl WorkerRuntime for CadQueryRuntime {
    fn name(&self) -> &'static str {
        "cadquery"
    }

    fn program(&self) -> &str {
        &self.interpreter
    }

    fn source_extension(&self) -> &'static str {
        "py"
    }

    fn driver_extension(&self) -> &'static str {
        "py"
    }

    fn render_driver(&self, binding: &str) -> String {
        fill_markers(CADQUERY_DRIVER, binding)
    }
}

// The "export" of the shell runtime writes the bound value's text to each
// format's file. Enough to drive the whole pipeline without a CAD kernel.
const SHELL_DRIVER: &str = r#"set -e
. "$CADFORGE_SOURCE"
set +e

if [ -z "${__CADFORGE_BINDING__+x}" ]; then
  echo "__RESULT_MISSING__ __CADFORGE_BINDING__"
  exit __MISSING_EXIT__
fi

echo "__RESULT_OK__"
for fmt in $(printf '%s' "$CADFORGE_FORMATS" | tr ',' ' '); do
  out="$CADFORGE_OUTPUT_DIR/$CADFORGE_UNIT_ID.$fmt"
  if err=$( { printf '%s\n' "$__CADFORGE_BINDING__" > "$out"; } 2>&1 ); then
    echo "$fmt:$out"
  else
    echo "__EXPORT_FAILED__ $fmt: $(printf '%s' "$err" | tr '\n' ' ')"
  fi
done
exit 0
"#;

/// POSIX shell worker. The generated code is sourced, so it binds the result
/// with a plain assignment (`result="..."`).
#[derive(Debug, Clone)]
pub struct ShellRuntime {
    shell: String,
}

impl ShellRuntime {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for ShellRuntime {
    fn default() -> Self {
        Self::new("sh")
    }
}

impl WorkerRuntime for ShellRuntime {
    fn name(&self) -> &'static str {
        "shell"
    }

    fn program(&self) -> &str {
        &self.shell
    }

    fn source_extension(&self) -> &'static str {
        "sh"
    }

    fn driver_extension(&self) -> &'static str {
        "sh"
    }

    fn render_driver(&self, binding: &str) -> String {
        fill_markers(SHELL_DRIVER, binding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cadquery_driver_checks_binding_explicitly() {
        let driver = CadQueryRuntime::default().render_driver("shape");
        assert!(driver.contains(r#"BINDING = "shape""#));
        assert!(driver.contains(RESULT_OK_MARKER));
        assert!(driver.contains(&format!("return {}", MISSING_RESULT_EXIT)));
        assert!(!driver.contains("__CADFORGE_BINDING__"));
        assert!(!driver.contains("__RESULT_OK__"));
    }

    #[test]
    fn shell_driver_substitutes_binding() {
        let driver = ShellRuntime::default().render_driver("result");
        assert!(driver.contains(r#"${result+x}"#));
        assert!(driver.contains(r#""$result""#));
        assert!(driver.contains(&format!("exit {}", MISSING_RESULT_EXIT)));
    }

    #[test]
    fn runtimes_report_programs() {
        assert_eq!(CadQueryRuntime::new("/opt/cq/bin/python").program(), "/opt/cq/bin/python");
        assert_eq!(ShellRuntime::default().program(), "sh");
        assert_eq!(ShellRuntime::default().source_extension(), "sh");
    }
}
