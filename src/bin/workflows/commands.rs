use anyhow::{bail, Context, Result};

pub(crate) fn dispatch(args: &[String]) -> Result<()> {
    let command = match args {
        [help] if matches!(help.as_str(), "-h" | "--help" | "help") => {
            println!("{}", crate::usage());
            return Ok(());
        }
        [build, rest @ ..] if build == "build" => {
            let parsed = crate::workflows::parse_build_args(rest)?;
            return crate::workflows::run_build(parsed);
        }
        [verify, tag] if verify == "verify" => crate::workflows::verify_cmd(tag, None),
        [verify, tag, recipe] if verify == "verify" => {
            crate::workflows::verify_cmd(tag, Some(recipe))
        }
        [compare, a, b] if compare == "compare" => crate::workflows::compare_cmd(a, b, None),
        [compare, a, b, recipe] if compare == "compare" => {
            crate::workflows::compare_cmd(a, b, Some(recipe))
        }
        [export, tag, dir] if export == "export" => crate::workflows::export_cmd(tag, dir, None),
        [export, tag, dir, recipe] if export == "export" => {
            crate::workflows::export_cmd(tag, dir, Some(recipe))
        }
        [runs] if runs == "runs" => crate::workflows::runs_cmd(None),
        [runs, recipe] if runs == "runs" => crate::workflows::runs_cmd(Some(recipe)),
        [store, status] if store == "store" && status == "status" => {
            crate::workflows::store_status(None)
        }
        [store, status, recipe] if store == "store" && status == "status" => {
            crate::workflows::store_status(Some(recipe))
        }
        [store, gc] if store == "store" && gc == "gc" => crate::workflows::store_gc(None),
        [store, gc, recipe] if store == "store" && gc == "gc" => {
            crate::workflows::store_gc(Some(recipe))
        }
        [store, prune, keep] if store == "store" && prune == "prune" => {
            crate::workflows::store_prune(crate::workflows::parse_keep(keep)?, None)
        }
        [store, prune, keep, recipe] if store == "store" && prune == "prune" => {
            crate::workflows::store_prune(crate::workflows::parse_keep(keep)?, Some(recipe))
        }
        _ => bail!(crate::usage()),
    };
    command.with_context(|| format!("running `ord-image {}`", args.join(" ")))
}
