//! Manifest language surface: includes, scoping, warning flags, errors.

use crate::e2e::*;

#[test]
fn include_and_subninja_scoping() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("inc.ninja", "var = from_include\n")?;
    space.write(
        "sub.ninja",
        "var = from_sub\nbuild sub_out: emit\n",
    )?;
    space.write(
        "build.ninja",
        "
rule emit
  command = echo $var > $out
include inc.ninja
subninja sub.ninja
build out: emit
",
    )?;
    space.run_expect(&mut majak_command(vec!["out", "sub_out"]))?;
    assert_eq!(
        String::from_utf8_lossy(&space.read("out")?).trim(),
        "from_include"
    );
    assert_eq!(
        String::from_utf8_lossy(&space.read("sub_out")?).trim(),
        "from_sub"
    );
    Ok(())
}

#[test]
fn builddir_holds_the_log() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            "builddir = build",
            TOUCH_RULE,
            "build out: touch in",
            "",
        ]
        .join("\n"),
    )?;
    space.write("in", "")?;
    space.run_expect(&mut majak_command(vec!["out"]))?;
    assert!(space.read("build/.majak_log").is_ok());
    assert!(space.read(".majak_log").is_err());
    Ok(())
}

#[test]
fn phony_self_reference_warns_by_default() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("build.ninja", "build x: phony x\n")?;
    let out = space.run_expect(&mut majak_command(vec!["x"]))?;
    assert_stderr_contains(&out, "names itself as an input");
    Ok(())
}

#[test]
fn phony_self_reference_rejected_with_flag() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("build.ninja", "build x: phony x\n")?;
    let out = space.run(&mut majak_command(vec!["-w", "phonycycle=err", "x"]))?;
    assert_eq!(out.status.code(), Some(1));
    assert_output_contains(&out, "names itself as an input");
    Ok(())
}

#[test]
fn duplicate_output_warns_by_default() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            TOUCH_RULE,
            "build out: touch in1",
            "build out: touch in2",
            "",
        ]
        .join("\n"),
    )?;
    space.write("in1", "")?;
    space.write("in2", "")?;
    let out = space.run_expect(&mut majak_command(vec!["out"]))?;
    assert_stderr_contains(&out, "multiple rules generate out");
    Ok(())
}

#[test]
fn duplicate_output_rejected_with_flag() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            TOUCH_RULE,
            "build out: touch in1",
            "build out: touch in2",
            "",
        ]
        .join("\n"),
    )?;
    let out = space.run(&mut majak_command(vec!["-w", "dupbuild=err", "out"]))?;
    assert_eq!(out.status.code(), Some(1));
    assert_output_contains(&out, "multiple rules generate out [-w dupbuild=err]");
    Ok(())
}

#[test]
fn tabs_are_rejected() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "rule touch\n\tcommand = touch $out\n",
    )?;
    let out = space.run(&mut majak_command(vec![]))?;
    assert_eq!(out.status.code(), Some(1));
    assert_output_contains(&out, "tabs are not allowed, use spaces");
    Ok(())
}

#[test]
fn parse_error_points_at_the_line() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("build.ninja", "rule touch\n  command = touch $out\nnonsense\n")?;
    let out = space.run(&mut majak_command(vec![]))?;
    assert_eq!(out.status.code(), Some(1));
    assert_output_contains(&out, "build.ninja:3");
    Ok(())
}

#[test]
fn required_version_is_enforced() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("build.ninja", "ninja_required_version = 99.0\n")?;
    let out = space.run(&mut majak_command(vec![]))?;
    assert_eq!(out.status.code(), Some(1));
    assert_output_contains(&out, "requires");
    Ok(())
}

#[test]
fn dependency_cycle_is_reported() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            TOUCH_RULE,
            "build a: touch b",
            "build b: touch a",
            "",
        ]
        .join("\n"),
    )?;
    let out = space.run(&mut majak_command(vec!["a"]))?;
    assert_eq!(out.status.code(), Some(1));
    assert_output_contains(&out, "dependency cycle");
    Ok(())
}

#[cfg(unix)]
#[test]
fn chdir_flag() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    std::fs::create_dir(space.path().join("project"))?;
    space.write(
        "project/build.ninja",
        &[TOUCH_RULE, "build out: touch in", ""].join("\n"),
    )?;
    space.write("project/in", "")?;
    let out = space.run_expect(&mut majak_command(vec!["-C", "project", "out"]))?;
    assert_output_contains(&out, "majak: Entering directory `project'");
    assert!(space.read("project/out").is_ok());
    Ok(())
}

#[test]
fn pool_declaration_applies() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            "pool serial",
            "  depth = 1",
            TOUCH_RULE,
            "build a: touch in",
            "  pool = serial",
            "build b: touch in",
            "  pool = serial",
            "",
        ]
        .join("\n"),
    )?;
    space.write("in", "")?;
    space.run_expect(&mut majak_command(vec!["a", "b"]))?;
    assert!(space.read("a").is_ok());
    assert!(space.read("b").is_ok());
    Ok(())
}

#[test]
fn unknown_pool_is_an_error() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[TOUCH_RULE, "build a: touch in", "  pool = nope", ""].join("\n"),
    )?;
    let out = space.run(&mut majak_command(vec!["a"]))?;
    assert_eq!(out.status.code(), Some(1));
    assert_output_contains(&out, "unknown pool name 'nope'");
    Ok(())
}

#[test]
fn debug_and_warning_lists() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("build.ninja", "")?;
    let out = space.run(&mut majak_command(vec!["-d", "list"]))?;
    assert_eq!(out.status.code(), Some(1));
    assert_output_contains(&out, "explain");
    let out = space.run(&mut majak_command(vec!["-w", "list"]))?;
    assert_eq!(out.status.code(), Some(1));
    assert_output_contains(&out, "dupbuild");
    Ok(())
}
