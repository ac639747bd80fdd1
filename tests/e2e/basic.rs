use crate::e2e::*;

#[test]
fn empty_file() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("build.ninja", "")?;
    let out = space.run_expect(&mut majak_command(vec![]))?;
    assert_output_contains(&out, "no work to do");
    Ok(())
}

#[test]
fn basic_build() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[TOUCH_RULE, "build out: touch in", ""].join("\n"),
    )?;
    space.write("in", "")?;
    space.run_expect(&mut majak_command(vec!["out"]))?;
    assert!(space.read("out").is_ok());
    Ok(())
}

#[test]
fn up_to_date_after_build() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[TOUCH_RULE, "build out: touch in", ""].join("\n"),
    )?;
    space.write("in", "")?;
    space.run_expect(&mut majak_command(vec!["out"]))?;
    let out = space.run_expect(&mut majak_command(vec!["out"]))?;
    assert_output_contains(&out, "no work to do");
    Ok(())
}

#[test]
fn create_subdir() -> anyhow::Result<()> {
    // Run a build rule whose output needs a subdir to be created first.
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[TOUCH_RULE, "build subdir/out: touch in", ""].join("\n"),
    )?;
    space.write("in", "")?;
    space.run_expect(&mut majak_command(vec!["subdir/out"]))?;
    assert!(space.read("subdir/out").is_ok());
    Ok(())
}

#[test]
fn specify_build_file() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build_specified.ninja",
        &[TOUCH_RULE, "build out: touch in", ""].join("\n"),
    )?;
    space.write("in", "")?;
    space.run_expect(&mut majak_command(vec!["-f", "build_specified.ninja", "out"]))?;
    assert!(space.read("out").is_ok());
    Ok(())
}

#[test]
fn default_targets() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            TOUCH_RULE,
            "build a: touch in",
            "build b: touch in",
            "build c: touch in",
            "default a b",
            "",
        ]
        .join("\n"),
    )?;
    space.write("in", "")?;
    space.run_expect(&mut majak_command(vec![]))?;
    assert!(space.read("a").is_ok());
    assert!(space.read("b").is_ok());
    assert!(space.read("c").is_err());
    Ok(())
}

#[test]
fn root_targets_when_no_default() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            TOUCH_RULE,
            "build mid: touch in",
            "build out: touch mid",
            "",
        ]
        .join("\n"),
    )?;
    space.write("in", "")?;
    space.run_expect(&mut majak_command(vec![]))?;
    assert!(space.read("out").is_ok());
    Ok(())
}

#[test]
fn unknown_target() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[TOUCH_RULE, "build out: touch in", ""].join("\n"),
    )?;
    let out = space.run(&mut majak_command(vec!["nonexistent"]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "unknown target");
    Ok(())
}

#[test]
fn missing_input() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[TOUCH_RULE, "build out: touch in", ""].join("\n"),
    )?;
    let out = space.run(&mut majak_command(vec!["out"]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "missing and no known rule to make it");
    Ok(())
}

#[test]
fn dry_run_has_no_effects() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[TOUCH_RULE, "build out: touch in", ""].join("\n"),
    )?;
    space.write("in", "")?;
    space.run_expect(&mut majak_command(vec!["-n", "out"]))?;
    assert!(space.read("out").is_err());
    // And it doesn't pollute the build log either.
    let out = space.run_expect(&mut majak_command(vec!["out"]))?;
    assert_output_not_contains(&out, "no work to do");
    assert!(space.read("out").is_ok());
    Ok(())
}

#[test]
fn phony_groups_targets() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            TOUCH_RULE,
            "build a: touch in",
            "build b: touch in",
            "build all: phony a b",
            "",
        ]
        .join("\n"),
    )?;
    space.write("in", "")?;
    space.run_expect(&mut majak_command(vec!["all"]))?;
    assert!(space.read("a").is_ok());
    assert!(space.read("b").is_ok());
    // "all" itself is not a file.
    assert!(space.read("all").is_err());
    Ok(())
}

#[cfg(unix)]
#[test]
fn failing_command_reports_failed() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule fail
  command = echo boom && exit 1
build out: fail in
",
    )?;
    space.write("in", "")?;
    let out = space.run(&mut majak_command(vec!["out"]))?;
    assert_eq!(out.status.code(), Some(1));
    assert_output_contains(&out, "FAILED: out");
    assert_output_contains(&out, "boom");
    assert_output_contains(&out, "subcommand failed");
    Ok(())
}

#[cfg(unix)]
#[test]
fn keep_going_builds_independent_targets() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            TOUCH_RULE,
            "rule fail",
            "  command = exit 1",
            "build bad: fail in",
            "build good: touch in",
            "build all: phony bad good",
            "",
        ]
        .join("\n"),
    )?;
    space.write("in", "")?;

    // With the default -k 1 and a single job, the failing edge may stop
    // "good" from being built; with -k 0 it must not.
    let out = space.run(&mut majak_command(vec!["-k", "0", "-j", "1", "all"]))?;
    assert_eq!(out.status.code(), Some(1));
    assert_output_contains(&out, "cannot make progress due to previous errors");
    assert!(space.read("good").is_ok());
    Ok(())
}

#[cfg(unix)]
#[test]
fn verbose_shows_command_lines() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[TOUCH_RULE, "build out: touch in", ""].join("\n"),
    )?;
    space.write("in", "")?;
    let out = space.run_expect(&mut majak_command(vec!["-v", "out"]))?;
    assert_output_contains(&out, "touch out");
    Ok(())
}

#[test]
fn status_format_from_environment() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            TOUCH_RULE,
            "build a: touch in",
            "build b: touch a",
            "",
        ]
        .join("\n"),
    )?;
    space.write("in", "")?;
    let mut cmd = majak_command(vec!["b"]);
    cmd.env("NINJA_STATUS", "<%f/%t> ");
    let out = space.run_expect(&mut cmd)?;
    assert_output_contains(&out, "<1/2> touch a");
    assert_output_contains(&out, "<2/2> touch b");
    Ok(())
}

#[cfg(unix)]
#[test]
fn generate_rsp_file() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule cat
  command = cat ${out}.rsp > ${out}
  rspfile = ${out}.rsp
  rspfile_content = 1 $in 2 $in_newline 3

rule litter
  command = cat make/me/${out}.rsp > ${out}
  rspfile = make/me/${out}.rsp
  rspfile_content = random stuff

rule touch
  command = touch $out

build main: cat foo bar baz in
build foo: litter bar
build bar: touch baz
build baz: touch in
",
    )?;
    space.write("in", "go!")?;

    space.run_expect(&mut majak_command(vec!["main"]))?;

    // The 'main' and 'foo' targets copy the contents of their rsp file to
    // their output.
    let main_rsp = space.read("main").unwrap();
    assert_eq!(main_rsp, b"1 foo bar baz in 2 foo\nbar\nbaz\nin 3");
    let foo_rsp = space.read("foo").unwrap();
    assert_eq!(foo_rsp, b"random stuff");

    // The rsp files themselves were deleted after a successful run.
    assert!(space.read("main.rsp").is_err());
    assert!(space.read("make/me/foo.rsp").is_err());

    // The 'make/me' directory created for the rsp file is still there.
    let meta = space.metadata("make/me").unwrap();
    assert!(meta.is_dir());

    // Run again: everything should be up to date.
    let out = space.run_expect(&mut majak_command(vec!["main"]))?;
    assert_output_contains(&out, "no work");
    Ok(())
}

#[cfg(unix)]
#[test]
fn keeprsp_retains_response_files() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule cat
  command = cat ${out}.rsp > ${out}
  rspfile = ${out}.rsp
  rspfile_content = hello
build out: cat in
",
    )?;
    space.write("in", "")?;
    space.run_expect(&mut majak_command(vec!["-d", "keeprsp", "out"]))?;
    assert_eq!(space.read("out.rsp").unwrap(), b"hello");
    Ok(())
}

#[cfg(unix)]
#[test]
fn console_pool_builds() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule touch
  command = touch $out
  pool = console
build out: touch in
",
    )?;
    space.write("in", "")?;
    space.run_expect(&mut majak_command(vec!["out"]))?;
    assert!(space.read("out").is_ok());
    Ok(())
}

#[cfg(unix)]
#[test]
fn spam_output() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule quiet
  description = quiet $out
  command = touch $out
rule spam
  description = spam $out
  command = echo greetz from $out && touch $out
build a: quiet
build b: spam a
build c: quiet b
",
    )?;
    let out = space.run_expect(&mut majak_command(vec!["-j", "1", "c"]))?;
    assert_output_contains(&out, "greetz from b");
    assert_output_contains(&out, "quiet c");
    Ok(())
}

#[cfg(unix)]
#[test]
fn interrupt_exits_with_code_2() -> anyhow::Result<()> {
    use std::os::unix::process::CommandExt;

    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule slow
  command = sleep 5 && touch $out
build a: slow
build b: slow
build c: slow
build all: phony a b c
",
    )?;
    let mut cmd = majak_command(vec!["-j", "4", "all"]);
    cmd.current_dir(space.path());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    // Give majak its own process group so the interrupt reaches the whole
    // job tree, as ^C in a terminal would.
    cmd.process_group(0);
    let child = cmd.spawn()?;
    let pid = child.id() as i32;

    std::thread::sleep(std::time::Duration::from_millis(500));
    unsafe {
        libc::kill(-pid, libc::SIGINT);
    }

    let out = child.wait_with_output()?;
    assert_eq!(out.status.code(), Some(2));
    assert_output_contains(&out, "interrupted by user");
    // Nothing finished, so nothing was produced.
    assert!(space.read("a").is_err());
    assert!(space.read("b").is_err());
    assert!(space.read("c").is_err());
    Ok(())
}
