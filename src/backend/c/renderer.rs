use super::{CCode, KERNEL_ENTRY};
use crate::op::{ConvOp, Reduction};
use crate::schedule::Schedule;
use log::debug;

/// Loop nest `oc0 -> oh -> ow0 -> oc -> ow`, then the reduction. Padding
/// positions are skipped, never read.
#[derive(Debug, Default)]
pub struct CRenderer {
    indent_level: usize,
    buffer: String,
}

impl CRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn render(&mut self, op: &ConvOp, schedule: &Schedule) -> CCode {
        self.indent_level = 0;
        self.buffer.clear();

        self.render_includes();
        self.render_kernel(op, schedule);
        self.line("");
        self.render_entry(op);

        let code = std::mem::take(&mut self.buffer);
        debug!("\n--- Rendered C code ---\n{code}\n-----------------------");
        CCode::new(code, op.name.clone())
    }

    fn render_includes(&mut self) {
        self.line("#include <stddef.h>");
        self.line("");
        self.line("static inline int conv_min(int a, int b) { return a < b ? a : b; }");
        self.line("");
    }

    fn render_kernel(&mut self, op: &ConvOp, schedule: &Schedule) {
        let in_ty = op.in_dtype.c_type();
        let acc = op.out_dtype.c_type();
        let lowering = op.lowering();
        let w = &op.workload;
        let out_channels = w.output_channel;
        let out_space = op.output_space;
        let (tc, tw) = (schedule.tile_channels, schedule.tile_width);

        self.line(&format!(
            "void {}(const {in_ty}* restrict input, const {in_ty}* restrict filter, {acc}* restrict output) {{",
            op.name
        ));
        self.indent_level += 1;
        self.open(&format!(
            "for (int oc0 = 0; oc0 < {out_channels}; oc0 += {tc}) {{"
        ));
        self.open(&format!("for (int oh = 0; oh < {out_space}; ++oh) {{"));
        self.open(&format!(
            "for (int ow0 = 0; ow0 < {out_space}; ow0 += {tw}) {{"
        ));
        self.open(&format!(
            "for (int oc = oc0; oc < conv_min(oc0 + {tc}, {out_channels}); ++oc) {{"
        ));
        self.open(&format!(
            "for (int ow = ow0; ow < conv_min(ow0 + {tw}, {out_space}); ++ow) {{"
        ));
        self.line(&format!("{acc} acc = 0;"));

        match lowering.reduction {
            Reduction::AllChannels => {
                self.open(&format!(
                    "for (int ic = 0; ic < {}; ++ic) {{",
                    w.input_channel
                ));
            }
            Reduction::SingleChannel => {
                self.line(&format!("const int ic = oc / {};", op.multiplier));
                self.line(&format!("const int q = oc % {};", op.multiplier));
            }
        }

        let unroll = schedule.unroll_kernel;
        self.window_loop("kh", "ih", "oh", w.kernel, w.stride, w.pad, w.space, unroll);
        self.window_loop("kw", "iw", "ow", w.kernel, w.stride, w.pad, w.space, unroll);
        self.line(&format!(
            "acc += ({acc})input[{}] * ({acc})filter[{}];",
            lowering.input_index, lowering.filter_index
        ));
        self.close(); // kw
        self.close(); // kh
        if lowering.reduction == Reduction::AllChannels {
            self.close();
        }

        self.line(&format!("output[{}] = acc;", lowering.output_index));
        for _ in 0..5 {
            self.close();
        }
        self.indent_level -= 1;
        self.line("}");
    }

    #[allow(clippy::too_many_arguments)]
    fn window_loop(
        &mut self,
        var: &str,
        input_var: &str,
        output_var: &str,
        kernel: usize,
        stride: usize,
        pad: usize,
        extent: usize,
        unroll: bool,
    ) {
        if unroll {
            self.line(&format!("#pragma GCC unroll {kernel}"));
        }
        self.open(&format!("for (int {var} = 0; {var} < {kernel}; ++{var}) {{"));
        self.line(&format!(
            "const int {input_var} = {output_var} * {stride} - {pad} + {var};"
        ));
        self.line(&format!(
            "if ({input_var} < 0 || {input_var} >= {extent}) continue;"
        ));
    }

    fn render_entry(&mut self, op: &ConvOp) {
        let in_ty = op.in_dtype.c_type();
        let acc = op.out_dtype.c_type();
        self.line(&format!("void {KERNEL_ENTRY}(void** args) {{"));
        self.indent_level += 1;
        self.line(&format!(
            "{}((const {in_ty}*)args[0], (const {in_ty}*)args[1], ({acc}*)args[2]);",
            op.name
        ));
        self.indent_level -= 1;
        self.line("}");
    }

    fn open(&mut self, header: &str) {
        self.line(header);
        self.indent_level += 1;
    }

    fn close(&mut self) {
        self.indent_level = self.indent_level.saturating_sub(1);
        self.line("}");
    }

    fn line(&mut self, text: &str) {
        if !text.is_empty() {
            for _ in 0..self.indent_level {
                self.buffer.push_str("    ");
            }
            self.buffer.push_str(text);
        }
        self.buffer.push('\n');
    }
}
