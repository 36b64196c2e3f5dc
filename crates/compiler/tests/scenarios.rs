//! End-to-end tests: compile and run whole programs, checking both the
//! captured `echo` output and the conventional program result.

use shannon_runtime::Variant;
use shannonc::{run_file_captured, run_file_captured_with, CompilerOptions, ShannonError};
use std::io::Write as _;
use std::path::PathBuf;

fn write_program(dir: &tempfile::TempDir, name: &str, source: &str) -> PathBuf {
    let path = dir.path().join(name);
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(source.as_bytes()).unwrap();
    path
}

fn run_source(source: &str) -> (Variant, String) {
    let dir = tempfile::tempdir().unwrap();
    let path = write_program(&dir, "main.shn", source);
    run_file_captured(&path).unwrap()
}

fn run_output(source: &str) -> String {
    run_source(source).1
}

fn run_error(source: &str) -> ShannonError {
    let dir = tempfile::tempdir().unwrap();
    let path = write_program(&dir, "main.shn", source);
    run_file_captured(&path).unwrap_err()
}

#[test]
fn test_const_string_concat() {
    let out = run_output("const s = 'ab' | 'cd' | 'ef'\necho s\n");
    assert_eq!(out, "abcdef\n");
}

#[test]
fn test_vector_element_assignment() {
    let out = run_output("var v = [1, 2, 3]\nv[1] = 20\necho v\n");
    assert_eq!(out, "[1, 20, 3]\n");
}

#[test]
fn test_range_membership() {
    let out = run_output("const r = 10..20\necho 15 in r, 25 in r\n");
    assert_eq!(out, "true, false\n");
}

#[test]
fn test_runtime_range_value() {
    let out = run_output("var r = 10..20\necho 15 in r, 25 in r, 10 in r\n");
    assert_eq!(out, "true, false, true\n");
}

#[test]
fn test_inline_range_bounds() {
    assert_eq!(run_output("echo 5 in 1..9, 0 in 1..9\n"), "true, false\n");
}

#[test]
fn test_function_call() {
    let out = run_output("def f(int a, int b): int { return a*a + b }\necho f(3, 4)\n");
    assert_eq!(out, "13\n");
}

#[test]
fn test_enum_echo_prints_name() {
    let out = run_output("enum Color = (red, green, blue)\necho green\n");
    assert_eq!(out, "green\n");
}

#[test]
fn test_short_circuit_and_skips_division() {
    let out = run_output("if false and (1/0 == 0) { } else { echo 'short' }\n");
    assert_eq!(out, "short\n");
}

#[test]
fn test_short_circuit_or_skips_division() {
    let out = run_output("if true or (1/0 == 0) { echo 'taken' }\n");
    assert_eq!(out, "taken\n");
}

#[test]
fn test_true_and_evaluates_right() {
    let out = run_output("if true and 2 > 1 { echo 'yes' }\n");
    assert_eq!(out, "yes\n");
}

#[test]
fn test_while_loop_with_break_continue() {
    let src = "\
var total = 0
var i = 0
while i < 10 {
    i += 1
    if i == 3 { continue }
    if i == 7 { break }
    total += i
}
echo total, i
";
    // 1+2+4+5+6 = 18, stopped at 7
    assert_eq!(run_output(src), "18, 7\n");
}

#[test]
fn test_if_elif_else_chain() {
    let src = "\
def grade(int n): str {
    if n >= 90 { return 'A' | '' }
    elif n >= 80 { return 'B' | '' }
    else { return 'C' | '' }
}
echo grade(95), grade(85), grade(40)
";
    assert_eq!(run_output(src), "A, B, C\n");
}

#[test]
fn test_case_statement() {
    let src = "\
def name(int n): str {
    case n {
        1: return 'one' | ''
        2, 3: return 'few' | ''
        4..9: return 'many' | ''
        else: return 'lots' | ''
    }
}
echo name(1), name(3), name(5), name(100)
";
    assert_eq!(run_output(src), "one, few, many, lots\n");
}

#[test]
fn test_dict_constructor_and_lookup() {
    let src = "\
var ages = ['bob': 30, 'ann': 25]
echo ages['ann']
ages['bob'] = 31
echo ages['bob']
";
    assert_eq!(run_output(src), "25\n31\n");
}

#[test]
fn test_dict_missing_key_raises() {
    let err = run_error("var d = ['a': 1]\necho d['zz']\n");
    assert!(matches!(err, ShannonError::Runtime(_)));
}

#[test]
fn test_dict_del_and_membership() {
    let src = "\
var d = [3: 'x', 7: 'y']
echo 3 in d, 5 in d
del d[3]
echo 3 in d
";
    assert_eq!(run_output(src), "true, false\nfalse\n");
}

#[test]
fn test_byte_dict_with_char_keys() {
    // a small-ordinal key type collapses to the sparse byte dictionary
    let src = "\
var bd = ['a': 1, 'c': 3]
echo 'a' in bd, 'b' in bd, bd['c']
";
    assert_eq!(run_output(src), "true, false, 3\n");
}

#[test]
fn test_byte_set_membership() {
    // char elements collapse to the 256-bit bitmap set
    let src = "\
var s = {'a', 'c', 'e'}
echo 'c' in s, 'd' in s
";
    assert_eq!(run_output(src), "true, false\n");
}

#[test]
fn test_variant_set_membership() {
    // wide-ordinal elements use the sorted variant set
    let src = "\
var s = {100, 500, 300}
echo 300 in s, 200 in s, #s
";
    assert_eq!(run_output(src), "true, false, 3\n");
}

#[test]
fn test_byte_set_ranges() {
    let src = "\
var digits = {'0'..'9', '_'}
echo '5' in digits, '_' in digits, 'x' in digits
";
    assert_eq!(run_output(src), "true, true, false\n");
}

#[test]
fn test_string_indexing_and_slicing() {
    let src = "\
var s = 'hello world'
echo s[0..5], s[6..], #s
";
    assert_eq!(run_output(src), "hello, world, 11\n");
}

#[test]
fn test_copy_on_write_containers() {
    let src = "\
var a = [1, 2, 3]
var b = a
b[0] = 99
echo a, b
";
    assert_eq!(run_output(src), "[1, 2, 3], [99, 2, 3]\n");
}

#[test]
fn test_del_vector_element() {
    assert_eq!(run_output("var v = [1, 2, 3]\ndel v[1]\necho v\n"), "[1, 3]\n");
}

#[test]
fn test_in_place_concat() {
    let src = "\
var s = 'ab' | 'c'
s |= 'd'
s |= 'ef' | 'g'
echo s
";
    assert_eq!(run_output(src), "abcdefg\n");
}

#[test]
fn test_nested_designator_assignment() {
    let src = "\
var m = ['k': [1, 2]]
var v = m['k']
v[0] = 10
m['k'] = v
echo m['k']
";
    assert_eq!(run_output(src), "[10, 2]\n");
}

#[test]
fn test_sibling_function_calls() {
    let src = "\
def double(int n): int { return n + n }
def quad(int n): int { return double(double(n)) }
echo quad(5)
";
    assert_eq!(run_output(src), "20\n");
}

#[test]
fn test_recursion() {
    let src = "\
def fib(int n): int {
    if n < 2 { return n }
    return fib(n - 1) + fib(n - 2)
}
echo fib(10)
";
    assert_eq!(run_output(src), "55\n");
}

#[test]
fn test_locals_shadow_and_scope() {
    let src = "\
def f(): int {
    var x = 1
    if true {
        var y = 10
        x = x + y
    }
    return x
}
echo f()
";
    assert_eq!(run_output(src), "11\n");
}

#[test]
fn test_program_result_ordinal() {
    let (result, _) = run_source("result = 5 + 2\n");
    assert_eq!(result, Variant::Ord(7));
}

#[test]
fn test_exit_stores_result_and_stops() {
    let src = "\
exit 42
echo 'unreachable'
";
    let (result, out) = run_source(src);
    assert_eq!(result, Variant::Ord(42));
    assert_eq!(out, "");
}

#[test]
fn test_assert_failure_is_runtime_error() {
    let err = run_error("var x = 1\nassert x > 1\n");
    match err {
        ShannonError::Runtime(e) => {
            let msg = e.to_string();
            assert!(msg.contains("x > 1"), "unexpected message: {}", msg);
        }
        other => panic!("expected runtime error, got {}", other),
    }
}

#[test]
fn test_assert_disabled_by_options() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_program(&dir, "main.shn", "assert 1 > 2\necho 'alive'\n");
    let mut opts = CompilerOptions::default();
    opts.enable_assert = false;
    let (_, out) = run_file_captured_with(&path, opts).unwrap();
    assert_eq!(out, "alive\n");
}

#[test]
fn test_dump_output() {
    let out = run_output("var x = 2 + 3\ndump x * 2\n");
    assert_eq!(out, "# x * 2: int = 10\n");
}

#[test]
fn test_explicit_cast_and_is() {
    let src = "\
const Small = 0..1000
var any v = 300
echo v is int, v is str
var small = v as Small
echo small
";
    assert_eq!(run_output(src), "true, false\n300\n");
}

#[test]
fn test_cast_out_of_range_raises() {
    let src = "\
const Byte = 0..255
var any v = 300
var b = v as Byte
";
    assert!(matches!(run_error(src), ShannonError::Runtime(_)));
}

#[test]
fn test_enum_subrange_and_bounds() {
    let src = "\
enum Color = (red, green, blue)
const Warm = red..green
echo green in Warm, blue in Warm
";
    assert_eq!(run_output(src), "true, false\n");
}

#[test]
fn test_type_alias_and_typed_var() {
    let src = "\
const Names = str[]
var Names names = ['ann' | '', 'bob' | '']
echo names[1]
";
    assert_eq!(run_output(src), "bob\n");
}

#[test]
fn test_module_import() {
    let dir = tempfile::tempdir().unwrap();
    write_program(
        &dir,
        "mathlib.shn",
        "var factor = 3\ndef scale(int n): int { return n * factor }\n",
    );
    let main = write_program(
        &dir,
        "main.shn",
        "uses mathlib\necho mathlib.scale(7)\necho mathlib.factor\n",
    );
    let mut opts = CompilerOptions::default();
    opts.module_path.push(dir.path().display().to_string());
    let (_, out) = run_file_captured_with(&main, opts).unwrap();
    assert_eq!(out, "21\n3\n");
}

#[test]
fn test_missing_module_is_error() {
    let err = run_error("uses nothere\n");
    assert!(matches!(err, ShannonError::Io(_)));
}

#[test]
fn test_unknown_identifier_compile_error() {
    let err = run_error("echo nosuchthing\n");
    match err {
        ShannonError::Compile(e) => assert!(e.to_string().contains("nosuchthing")),
        other => panic!("expected compile error, got {}", other),
    }
}

#[test]
fn test_duplicate_identifier_compile_error() {
    let err = run_error("var x = 1\nvar x = 2\n");
    match err {
        ShannonError::Compile(e) => assert!(e.to_string().contains("Duplicate")),
        other => panic!("expected compile error, got {}", other),
    }
}

#[test]
fn test_type_mismatch_compile_error() {
    let err = run_error("var x = 1\nx = 'not an int'\n");
    assert!(matches!(err, ShannonError::Compile(_)));
}

#[test]
fn test_const_folding_divide_by_zero() {
    let err = run_error("const bad = 1 / 0\n");
    match err {
        ShannonError::Compile(e) => {
            assert!(e.to_string().contains("constant expression"), "{}", e)
        }
        other => panic!("expected compile error, got {}", other),
    }
}

#[test]
fn test_bitwise_and_on_integers() {
    assert_eq!(run_output("echo 12 and 10, 12 or 3, 6 xor 3\n"), "8, 15, 5\n");
}

#[test]
fn test_arith_precedence_and_unary() {
    assert_eq!(run_output("echo 2 + 3 * 4, -5 + 1, 7 mod 3, 1 shl 4\n"), "14, -4, 1, 16\n");
}

#[test]
fn test_nested_vector_render() {
    let out = run_output("var v = [[1, 2], [3]]\necho #v, v[1]\n");
    assert_eq!(out, "2, [3]\n");
}

#[test]
fn test_empty_container_literal() {
    let src = "\
var str[] names = []
echo #names
names |= 'zz' | ''
echo #names
";
    assert_eq!(run_output(src), "0\n1\n");
}

#[test]
fn test_module_init_runs_in_dependency_order() {
    let dir = tempfile::tempdir().unwrap();
    write_program(&dir, "base.shn", "echo 'base init'\nvar ready = 1\n");
    let main = write_program(&dir, "main.shn", "uses base\necho 'main init'\n");
    let mut opts = CompilerOptions::default();
    opts.module_path.push(dir.path().display().to_string());
    let (_, out) = run_file_captured_with(&main, opts).unwrap();
    assert_eq!(out, "base init\nmain init\n");
}
