//! Dynamically discovered dependencies: depfiles, and the deps entries
//! recorded in the build log.

use crate::e2e::*;

/// A rule that emits a Makefile-style depfile naming "hdr" as an extra
/// input, the way a C compiler would for an #include.
#[cfg(unix)]
const CC_DEPS_RULE: &str = "
rule cc
  command = echo '$out: hdr' > $out.d && echo mark >> $out.stamp && touch $out
  depfile = $out.d
  deps = gcc
";

#[cfg(unix)]
const CC_DEPFILE_RULE: &str = "
rule cc
  command = echo '$out: hdr' > $out.d && echo mark >> $out.stamp && touch $out
  depfile = $out.d
";

#[cfg(unix)]
#[test]
fn deps_recorded_and_replayed_from_log() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[CC_DEPS_RULE, "build out: cc in", ""].join("\n"),
    )?;
    space.write("in", "")?;
    space.write("hdr", "")?;

    space.run_expect(&mut majak_command(vec!["out"]))?;
    assert_eq!(space.mark_count("out.stamp"), 1);
    // With deps=gcc the depfile is consumed into the log and deleted.
    assert!(space.read("out.d").is_err());

    let out = space.run_expect(&mut majak_command(vec!["out"]))?;
    assert_output_contains(&out, "no work to do");

    // Touching the discovered header dirties the edge.
    space.tick();
    space.write("hdr", "changed")?;
    space.run_expect(&mut majak_command(vec!["out"]))?;
    assert_eq!(space.mark_count("out.stamp"), 2);
    Ok(())
}

#[cfg(unix)]
#[test]
fn keepdepfile_retains_depfile() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[CC_DEPS_RULE, "build out: cc in", ""].join("\n"),
    )?;
    space.write("in", "")?;
    space.write("hdr", "")?;
    space.run_expect(&mut majak_command(vec!["-d", "keepdepfile", "out"]))?;
    assert_eq!(space.read("out.d").unwrap(), b"out: hdr\n");
    Ok(())
}

#[cfg(unix)]
#[test]
fn depfile_without_deps_is_read_at_scan_time() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[CC_DEPFILE_RULE, "build out: cc in", ""].join("\n"),
    )?;
    space.write("in", "")?;
    space.write("hdr", "")?;

    space.run_expect(&mut majak_command(vec!["out"]))?;
    // Without deps= the depfile stays on disk and is reparsed every scan.
    assert!(space.read("out.d").is_ok());

    let out = space.run_expect(&mut majak_command(vec!["out"]))?;
    assert_output_contains(&out, "no work to do");

    space.tick();
    space.write("hdr", "changed")?;
    space.run_expect(&mut majak_command(vec!["out"]))?;
    assert_eq!(space.mark_count("out.stamp"), 2);
    Ok(())
}

#[cfg(unix)]
#[test]
fn missing_discovered_dep_rebuilds() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[CC_DEPS_RULE, "build out: cc in", ""].join("\n"),
    )?;
    space.write("in", "")?;
    space.write("hdr", "")?;
    space.run_expect(&mut majak_command(vec!["out"]))?;

    // Deleting the build log's deps info forces a rebuild: the edge can't
    // prove its discovered deps are current.
    std::fs::remove_file(space.path().join(".majak_log"))?;
    space.run_expect(&mut majak_command(vec!["out"]))?;
    assert_eq!(space.mark_count("out.stamp"), 2);
    Ok(())
}

#[cfg(unix)]
#[test]
fn explain_names_the_reason() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[TOUCH_RULE, "build out: touch in", ""].join("\n"),
    )?;
    space.write("in", "")?;
    let out = space.run_expect(&mut majak_command(vec!["-d", "explain", "out"]))?;
    assert_stderr_contains(&out, "majak explain: output out doesn't exist");

    space.run_expect(&mut majak_command(vec!["out"]))?;
    space.tick();
    space.write("in", "changed")?;
    let out = space.run_expect(&mut majak_command(vec!["-d", "explain", "out"]))?;
    assert_stderr_contains(&out, "older than most recent input");
    Ok(())
}
