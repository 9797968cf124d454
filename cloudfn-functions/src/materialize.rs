//! Code materialization
//!
//! Wraps user source in a generated entry point so that it becomes a
//! complete program. Every generated program:
//!
//! - reads the JSON event from `FUNCTION_EVENT` and the JSON string map from
//!   `FUNCTION_CONTEXT` (absent or empty means a null event and an empty
//!   context),
//! - calls the handler with `(event, context)`,
//! - writes exactly one JSON envelope to stdout: `{"success":true,"result":..}`
//!   and exit 0, or `{"success":false,"error":..}` and exit 1.
//!
//! Anything the user code prints to stdout is redirected to stderr so the
//! envelope stays the only document on stdout.
//!
//! Declaration detection (Go `package` clauses, Python `__future__` imports)
//! is a line-based string check, not a parse. Source that hides these in
//! unusual places can still fail to build.

use crate::function::{Function, Runtime};

/// Environment variable carrying the JSON-encoded event
pub const EVENT_ENV: &str = "FUNCTION_EVENT";

/// Environment variable carrying the JSON-encoded context map
pub const CONTEXT_ENV: &str = "FUNCTION_CONTEXT";

const HANDLER_MARKER: &str = "__HANDLER__";

/// A complete program ready to build or interpret
#[derive(Debug, Clone)]
pub struct Program {
    pub runtime: Runtime,
    pub file_name: &'static str,
    pub source: String,
}

/// Generate the program for a function
pub fn materialize(function: &Function) -> Program {
    let source = match function.runtime {
        Runtime::Go => materialize_go(&function.code, &function.handler),
        Runtime::Nodejs => materialize_node(&function.code, &function.handler),
        Runtime::Python => materialize_python(&function.code, &function.handler),
    };

    Program {
        runtime: function.runtime,
        file_name: function.runtime.source_file(),
        source,
    }
}

/// Whether `handler` can be spliced into the generated entry point
///
/// Go and Python accept `[A-Za-z_][A-Za-z0-9_]*`; JavaScript also allows `$`.
pub fn is_valid_handler(runtime: Runtime, handler: &str) -> bool {
    let allow_dollar = matches!(runtime, Runtime::Nodejs);
    let ident_char = |c: char| c == '_' || (allow_dollar && c == '$');

    let mut chars = handler.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || ident_char(c) => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || ident_char(c))
}

// === Go ===

const GO_IMPORTS: &str = r#"
import (
	cfjson "encoding/json"
	cffmt "fmt"
	cfos "os"
)
"#;

const GO_ENTRY: &str = r#"

func cfEmit(out *cfos.File, payload map[string]interface{}) bool {
	data, err := cfjson.Marshal(payload)
	if err != nil {
		data, _ = cfjson.Marshal(map[string]interface{}{
			"success": false,
			"error":   "result is not JSON serializable: " + err.Error(),
		})
		out.Write(data)
		return false
	}
	out.Write(data)
	return true
}

func main() {
	cfStdout := cfos.Stdout
	cfos.Stdout = cfos.Stderr

	var cfEvent interface{}
	cfContext := map[string]string{}
	if raw := cfos.Getenv("FUNCTION_EVENT"); raw != "" {
		if err := cfjson.Unmarshal([]byte(raw), &cfEvent); err != nil {
			cfEmit(cfStdout, map[string]interface{}{"success": false, "error": "invalid FUNCTION_EVENT: " + err.Error()})
			cfos.Exit(1)
		}
	}
	if raw := cfos.Getenv("FUNCTION_CONTEXT"); raw != "" {
		if err := cfjson.Unmarshal([]byte(raw), &cfContext); err != nil {
			cfEmit(cfStdout, map[string]interface{}{"success": false, "error": "invalid FUNCTION_CONTEXT: " + err.Error()})
			cfos.Exit(1)
		}
	}

	defer func() {
		if r := recover(); r != nil {
			cfEmit(cfStdout, map[string]interface{}{"success": false, "error": cffmt.Sprint(r)})
			cfos.Exit(1)
		}
	}()

	cfResult := __HANDLER__(cfEvent, cfContext)
	if !cfEmit(cfStdout, map[string]interface{}{"success": true, "result": cfResult}) {
		cfos.Exit(1)
	}
}
"#;

/// The handler is called literally, so an undeclared name fails the build.
///
/// The wrapper imports its packages under private aliases, which cannot
/// collide with whatever the user imports.
fn materialize_go(code: &str, handler: &str) -> String {
    let entry = GO_ENTRY.replace(HANDLER_MARKER, handler);
    let mut out = String::with_capacity(code.len() + GO_IMPORTS.len() + entry.len() + 16);

    match split_go_package(code) {
        Some((package_clause, rest)) => {
            out.push_str(package_clause);
            out.push('\n');
            out.push_str(GO_IMPORTS);
            out.push_str(rest);
        }
        None => {
            out.push_str("package main\n");
            out.push_str(GO_IMPORTS);
            out.push('\n');
            out.push_str(code);
        }
    }

    out.push_str(&entry);
    out
}

/// Split at the first line that starts with a `package` clause
fn split_go_package(code: &str) -> Option<(&str, &str)> {
    let mut offset = 0;
    for line in code.split_inclusive('\n') {
        if line.trim_start().starts_with("package ") {
            let end = offset + line.len();
            return Some((code[..end].trim_end(), &code[end..]));
        }
        offset += line.len();
    }
    None
}

// === Node.js ===

const NODE_PRELUDE: &str = "\
const __cfStdout = process.stdout.write.bind(process.stdout);
console.log = console.error;
console.info = console.error;
console.debug = console.error;

";

const NODE_ENTRY: &str = r#"

;(async () => {
  const emit = (payload) => {
    let text;
    let ok = true;
    try {
      text = JSON.stringify(payload);
    } catch (err) {
      text = JSON.stringify({ success: false, error: 'result is not JSON serializable: ' + err.message });
      ok = false;
    }
    __cfStdout(text);
    return ok;
  };

  let event = null;
  let context = {};
  try {
    const rawEvent = process.env.FUNCTION_EVENT || '';
    const rawContext = process.env.FUNCTION_CONTEXT || '';
    event = rawEvent === '' ? null : JSON.parse(rawEvent);
    context = rawContext === '' ? {} : JSON.parse(rawContext);
  } catch (err) {
    emit({ success: false, error: 'invalid invocation input: ' + err.message });
    process.exitCode = 1;
    return;
  }

  let handler;
  if (typeof __HANDLER__ === 'function') {
    handler = __HANDLER__;
  } else if (module.exports && typeof module.exports['__HANDLER__'] === 'function') {
    handler = module.exports['__HANDLER__'];
  } else {
    emit({ success: false, error: 'handler __HANDLER__ is not defined or not a function' });
    process.exitCode = 1;
    return;
  }

  try {
    const result = await handler(event, context);
    if (!emit({ success: true, result: result === undefined ? null : result })) {
      process.exitCode = 1;
    }
  } catch (err) {
    console.error(err && err.stack ? err.stack : String(err));
    emit({ success: false, error: err && err.message ? err.message : String(err) });
    process.exitCode = 1;
  }
})();
"#;

/// `typeof` on an undeclared name does not throw, so a missing handler is
/// reported as a structured error. `module.exports` is checked second.
fn materialize_node(code: &str, handler: &str) -> String {
    let entry = NODE_ENTRY.replace(HANDLER_MARKER, handler);
    let mut out = String::with_capacity(NODE_PRELUDE.len() + code.len() + entry.len());
    out.push_str(NODE_PRELUDE);
    out.push_str(code);
    out.push_str(&entry);
    out
}

// === Python ===

const PYTHON_PRELUDE: &str = "\
import json as _cf_json
import os as _cf_os
import sys as _cf_sys
import traceback as _cf_traceback

_cf_stdout = _cf_sys.stdout
_cf_sys.stdout = _cf_sys.stderr

";

const PYTHON_ENTRY: &str = r#"


def _cf_emit(payload):
    try:
        text = _cf_json.dumps(payload)
        ok = True
    except (TypeError, ValueError) as exc:
        text = _cf_json.dumps({"success": False, "error": "result is not JSON serializable: %s" % exc})
        ok = False
    _cf_stdout.write(text)
    _cf_stdout.flush()
    return ok


def _cf_main():
    raw_event = _cf_os.environ.get("FUNCTION_EVENT", "")
    raw_context = _cf_os.environ.get("FUNCTION_CONTEXT", "")
    try:
        event = _cf_json.loads(raw_event) if raw_event else None
        context = _cf_json.loads(raw_context) if raw_context else {}
    except ValueError as exc:
        _cf_emit({"success": False, "error": "invalid invocation input: %s" % exc})
        return 1

    handler = globals().get("__HANDLER__")
    if handler is None:
        _cf_emit({"success": False, "error": "handler __HANDLER__ is not defined"})
        return 1
    if not callable(handler):
        _cf_emit({"success": False, "error": "handler __HANDLER__ is not callable"})
        return 1

    try:
        result = handler(event, context)
    except BaseException as exc:
        _cf_traceback.print_exc()
        _cf_emit({"success": False, "error": str(exc) or type(exc).__name__})
        return 1

    return 0 if _cf_emit({"success": True, "result": result}) else 1


if __name__ == "__main__":
    _cf_sys.exit(_cf_main())
"#;

/// The handler is looked up in the module globals at run time. Nested or
/// shadowed definitions are not found; only top-level names are.
///
/// `from __future__` imports must open the module, so they are hoisted above
/// the generated prelude.
fn materialize_python(code: &str, handler: &str) -> String {
    let entry = PYTHON_ENTRY.replace(HANDLER_MARKER, handler);
    let (future_imports, body) = hoist_future_imports(code);

    let mut out = String::with_capacity(
        future_imports.len() + PYTHON_PRELUDE.len() + body.len() + entry.len(),
    );
    out.push_str(&future_imports);
    out.push_str(PYTHON_PRELUDE);
    out.push_str(&body);
    out.push_str(&entry);
    out
}

fn hoist_future_imports(code: &str) -> (String, String) {
    let mut future_imports = String::new();
    let mut body = String::with_capacity(code.len());

    for line in code.split_inclusive('\n') {
        if line.starts_with("from __future__ import") {
            future_imports.push_str(line.trim_end());
            future_imports.push('\n');
        } else {
            body.push_str(line);
        }
    }

    (future_imports, body)
}
