//! Runs whole Joker programs and compares what they print.

use joker::prelude::*;
use pretty_assertions::assert_eq;

/// Runs a program on a fresh VM and returns everything it printed.
fn run(source: &str) -> String {
    let mut vm = VM::default();
    vm.capture_output();
    if let Err(error) = vm.interpret(source) {
        panic!("{error}:\n{}", vm.take_errors());
    }
    vm.take_output()
}

/// Runs a program that must fail, returning the kind of failure and the report.
fn fail(source: &str) -> (InterpretationError, String) {
    let mut vm = VM::default();
    vm.capture_output();
    let error = vm
        .interpret(source)
        .expect_err("the program should have failed");
    (error, vm.take_errors())
}

fn stressed() -> VM {
    let mut config = Config::default();
    config.gc.stress = true;
    let mut vm = VM::new(config);
    vm.capture_output();
    vm
}

#[test]
fn arithmetic_promotes_numbers() {
    let output = run("
        println(1 + 2);
        println(1 + 2.0);
        println(7 / 2);
        println(7 % 3);
        println(2.5 * 2);
        println(1 << 4 | 1);
        println(-(3 - 5));
    ");
    assert_eq!("3\n3.0\n3\n1\n5.0\n17\n2\n", output);
}

#[test]
fn division_by_zero_is_a_runtime_error() {
    let (error, report) = fail("var a = 5;\nprintln(a / 0);");
    assert_eq!(InterpretationError::RuntimeError, error);
    assert_eq!("Division by zero.\n[line 2] in script\n", report);

    let (_, report) = fail("println(5.0 % 0.0);");
    assert!(report.starts_with("Division by zero."));
}

#[test]
fn integer_overflow_is_checked() {
    let (error, report) = fail("var big = 2147483647;\nbig + 1;");
    assert_eq!(InterpretationError::RuntimeError, error);
    assert_eq!("Integer overflow.\n[line 2] in script\n", report);
}

#[test]
fn annotations_convert_numbers() {
    let output = run("
        var a: f64 = 5;
        var b: i32 = 5;
        println(a, b);
    ");
    assert_eq!("5.0 5\n", output);
}

#[test]
fn closures_count() {
    let output = run("
        fn make_counter() {
            var count = 0;
            return || {
                count += 1;
                return count;
            };
        }

        var counter = make_counter();
        counter();
        println(counter());
    ");
    assert_eq!("2\n", output);
}

#[test]
fn loop_bodies_capture_fresh_bindings() {
    let output = run("
        var captured = [];
        for (var i = 0; i < 3; i += 1) {
            var j = i;
            captured.push(|| j);
        }
        println(captured[0](), captured[1](), captured[2]());
    ");
    assert_eq!("0 1 2\n", output);
}

#[test]
fn break_and_continue() {
    let output = run("
        var total = 0;
        var i = 0;
        while i < 10 {
            i += 1;
            if i % 2 == 0 { continue; }
            if i > 7 { break; }
            total += i;
        }
        println(total);

        var n = 0;
        loop {
            n += 1;
            if n == 4 { break; }
        }
        println(n);

        for (var k = 0; k < 5; k += 1) {
            var skipped = k * 10;
            if k < 3 { continue; }
            println(skipped);
        }
    ");
    assert_eq!("16\n4\n30\n40\n", output);
}

#[test]
fn match_on_enum_members() {
    let output = run("
        enum Shape { Circle(i32), Rect(i32, i32), Empty }

        fn area(shape) {
            match shape {
                Shape::Circle(r) => return 3 * r * r;
                Shape::Rect(w, h) => return w * h;
                _ => return 0;
            }
        }

        println(area(Shape::Rect(1, 5)));
        println(area(Shape::Circle(2)));
        println(area(Shape::Empty));
        println(Shape::Circle(5), Shape::Empty);
    ");
    assert_eq!("5\n12\n0\nShape::Circle(5) Shape::Empty\n", output);
}

#[test]
fn match_on_literals() {
    let output = run(r#"
        fn describe(n) {
            match n {
                0 => println("zero"),
                1 => { println("one"); }
                _ => println("many"),
            }
        }
        describe(0);
        describe(1);
        describe(7);

        match "b" {
            "a" => println(1),
            "b" => println(2),
        }
    "#);
    assert_eq!("zero\none\nmany\n2\n", output);
}

#[test]
fn enum_members_check_their_payload() {
    let (_, report) = fail("enum E { A(i32) }\nE::A;");
    assert!(report.starts_with("Member 'A' carries 1 values; construct it with a call."));

    let (_, report) = fail("enum E { A }\nE::B;");
    assert!(report.starts_with("Undefined member 'B' in enum 'E'."));
}

#[test]
fn classes_and_inheritance() {
    let output = run(r#"
        class Animal {
            fn init(name) {
                self.name = name;
            }
            fn speak() {
                return self.name + " makes a sound";
            }
        }

        class Dog : Animal {
            fn speak() {
                return super.speak() + " (woof)";
            }
        }

        var dog = Dog("Rex");
        println(dog.speak());

        var speak = dog.speak;
        println(speak());
        println(Dog, dog);
    "#);
    assert_eq!(
        "Rex makes a sound (woof)\n\
         Rex makes a sound (woof)\n\
         <class Dog> <Dog instance>\n",
        output
    );
}

#[test]
fn static_methods_through_layer_access() {
    let output = run("
        class Math {
            fn twice(n) { return n * 2; }
        }
        println(Math::twice(21));
    ");
    assert_eq!("42\n", output);
}

#[test]
fn structs_have_fixed_fields() {
    let output = run("
        struct Point { x: i32, y: i32 }
        struct Point3 : Point { z }

        var p = Point(1, 2);
        p.x += 4;
        println(p);
        println(Point3(1, 2, 3));
    ");
    assert_eq!("Point { x: 5, y: 2 }\nPoint3 { x: 1, y: 2, z: 3 }\n", output);

    let (_, report) = fail("struct P { x }\nvar p = P(1);\np.y = 2;");
    assert_eq!("Undefined field 'y' in struct 'P'.\n[line 3] in script\n", report);

    let (_, report) = fail("struct P { x }\nP(1, 2);");
    assert!(report.starts_with("Expected 1 arguments but got 2."));
}

#[test]
fn vectors() {
    let output = run("
        var v = Vec::new();
        v.push(1);
        v.push(2);
        println(v, v.len());

        var w = [3, 4] + v;
        w[0] = 30;
        w.reverse();
        println(w, w.first(), w.last(), w.contains(4));
        println([1, 2] == [1, 2], [1] == [2]);
    ");
    assert_eq!("[1, 2] 2\n[2, 1, 4, 30] 2 30 true\ntrue false\n", output);

    let (_, report) = fail("var v = [1];\nv[1];");
    assert_eq!("Index 1 out of bounds (len=1).\n[line 2] in script\n", report);
}

#[test]
fn self_referencing_vectors_display_as_cycles() {
    let output = run("
        var v = [1];
        v.push(v);
        println(v);
    ");
    assert_eq!("[1, [...]]\n", output);
}

#[test]
fn self_referencing_vectors_compare() {
    let output = run("
        var a = [];
        a.push(a);
        var b = [];
        b.push(b);
        println(a == b, a != b, a == a);

        var c = [1];
        c.push(c);
        println(a == c, [a] == [b], a.contains(b));
    ");
    assert_eq!("true false true\nfalse true true\n", output);
}

#[test]
fn strings() {
    let output = run(r#"
        var s = "joker";
        println(s[0], s.len(), s.contains("ok"));
        println(1 + "a", "a" + 2.0);
        println("ab" == "a" + "b");
    "#);
    assert_eq!("j 5 true\n1a a2.0\ntrue\n", output);
}

#[test]
fn format_strings() {
    let output = run(r#"
        println("%d apples cost %f, %s? %b 100%%", 3, 2.5, "ok", true);
        print("tab\tend\n");
        println(1, None, true);
    "#);
    assert_eq!("3 apples cost 2.5, ok? true 100%\ntab\tend\n1 None true\n", output);

    let (_, report) = fail(r#"println("%d", 1.5);"#);
    assert!(report.starts_with("Format specifier '%d' does not accept 'f64'."));
}

#[test]
fn types_are_values() {
    let output = run("
        println(type_of(1));
        println(type_of(1) == type_of(2), type_of(1) == type_of(1.0));
        println(type_of([1]), type_of(\"s\"));
    ");
    assert_eq!("<type i32>\ntrue false\n<type Vec> <type str>\n", output);
}

#[test]
fn ternary_and_logic() {
    let output = run("
        var a = 3;
        println(a > 2 ? \"big\" : \"small\");
        println(a > 5 or a == 3, a > 5 and a == 3, !(a == 3));
    ");
    assert_eq!("big\ntrue false false\n", output);
}

#[test]
fn lambdas_are_first_class() {
    let output = run("
        fn apply(f, x) { return f(x); }
        var add = |a, b| a + b;
        println(apply(|n| n * n, 7), add(1, 2));
    ");
    assert_eq!("49 3\n", output);
}

#[test]
fn compile_errors_are_reported_and_nothing_runs() {
    let (error, report) = fail("println(1);\nvar = 2;\nprintln(3)");
    assert_eq!(InterpretationError::CompileError, error);
    assert_eq!(
        "[line 2] Error at '=': Expect variable name.\n\
         [line 3] Error at end: Expect ';' after expression.\n",
        report
    );
}

#[test]
fn garbage_is_collected_under_stress() {
    let mut vm = stressed();
    vm.interpret(r#"
        struct Node { value, next }
        var list = None;
        for (var i = 0; i < 50; i += 1) {
            list = Node("n" + i, list);
            var garbage = [i, i + 1, "tmp" + i];
        }
        var count = 0;
        var node = list;
        while node != None {
            count += 1;
            node = node.next;
        }
        println(count, list.value);
    "#)
    .unwrap();
    assert_eq!("50 n49\n", vm.take_output());
}

#[test]
fn natives_can_be_registered() {
    fn double(vm: &mut VM, args: &[Value]) -> Fallible<Value> {
        match args[0] {
            Value::I32(n) => Ok(Value::I32(n * 2)),
            other => Err(Fault::new(format!(
                "double() expects an i32, found '{}'.",
                vm.heap.type_name(other)
            ))),
        }
    }

    let mut vm = VM::default();
    vm.capture_output();
    vm.define_native("double", Arity::Exact(1), double);
    vm.interpret("println(double(21));").unwrap();
    assert_eq!("42\n", vm.take_output());

    assert_eq!(
        Err(InterpretationError::RuntimeError),
        vm.interpret("double(true);")
    );
    assert_eq!(
        "double() expects an i32, found 'bool'.\n[line 1] in script\n",
        vm.take_errors()
    );
}
